//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Derived-value calculators for the furnace pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::IntegrationClock;

/// Pressure difference between the two cooling circuits.
pub fn pressure_diff(press_1: f64, press_2: f64) -> f64 {
    press_1 - press_2
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CoolingTotals {
    /// Shell circuit volume, m³.
    pub shell_total: f64,
    /// Cover circuit volume, m³.
    pub cover_total: f64,
}

/// Batch-scoped cumulative cooling-water volumes.
#[derive(Debug, Clone, Default)]
pub struct CoolingCalculator {
    clock: IntegrationClock,
    totals: CoolingTotals,
}

impl CoolingCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate the shell and cover flow rates (m³/h) up to `now`.
    pub fn update(&mut self, shell_flow: f64, cover_flow: f64, now: DateTime<Utc>) -> CoolingTotals {
        if let Some(dt) = self.clock.step(now) {
            let hours = dt / 3600.0;
            // f64::max discards NaN, so a garbage reading adds nothing
            self.totals.shell_total += shell_flow.max(0.0) * hours;
            self.totals.cover_total += cover_flow.max(0.0) * hours;
        }
        self.totals
    }

    pub fn totals(&self) -> CoolingTotals {
        self.totals
    }

    /// Zero the totals at batch start.
    pub fn reset(&mut self) {
        self.totals = CoolingTotals::default();
        self.clock.reset();
    }
}
