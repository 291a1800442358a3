//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Derived-value calculators for the furnace pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Three-phase arc power and the process-lifetime energy integral.

use chrono::{DateTime, Utc};
use serde::Serialize;
use smelt_common::PhaseValues;

use crate::clock::IntegrationClock;

/// Power factor applied to the apparent arc power.
pub const ARC_POWER_FACTOR: f64 = 0.85;

/// Instantaneous arc power in kW: `Σ(I·V) · 0.85 / 1000`, never negative.
pub fn arc_power_kw(current: &PhaseValues, voltage: &PhaseValues) -> f64 {
    let apparent: f64 = current
        .iter()
        .zip(voltage.iter())
        .map(|((_, amps), (_, volts))| amps * volts)
        .sum();
    (apparent * ARC_POWER_FACTOR / 1000.0).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyReading {
    pub power_total: f64,
    pub energy_total: f64,
}

/// Integrates arc power over wall-clock time. The total only resets with the process.
#[derive(Debug, Clone, Default)]
pub struct EnergyCalculator {
    clock: IntegrationClock,
    energy_total: f64,
    power_total: f64,
}

impl EnergyCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        current: &PhaseValues,
        voltage: &PhaseValues,
        now: DateTime<Utc>,
    ) -> EnergyReading {
        self.power_total = arc_power_kw(current, voltage);
        if let Some(dt) = self.clock.step(now) {
            self.energy_total += self.power_total * dt / 3600.0;
        }
        self.reading()
    }

    pub fn reading(&self) -> EnergyReading {
        EnergyReading {
            power_total: self.power_total,
            energy_total: self.energy_total,
        }
    }

    pub fn energy_total(&self) -> f64 {
        self.energy_total
    }

    /// Forget the last sample time so the next update only re-arms the clock.
    pub fn reset_clock(&mut self) {
        self.clock.reset();
    }

    pub fn gaps(&self) -> u64 {
        self.clock.gaps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn power_uses_fixed_power_factor() {
        let current = PhaseValues::new(5000.0, 5000.0, 5000.0);
        let voltage = PhaseValues::new(90.0, 90.0, 90.0);
        let expected = 3.0 * 5000.0 * 90.0 * 0.85 / 1000.0;
        assert!((arc_power_kw(&current, &voltage) - expected).abs() < 1e-9);
    }

    #[test]
    fn negative_and_nan_power_clamps_to_zero() {
        let current = PhaseValues::new(-100.0, 0.0, 0.0);
        let voltage = PhaseValues::new(90.0, 0.0, 0.0);
        assert_eq!(arc_power_kw(&current, &voltage), 0.0);
        let nan = PhaseValues::new(f64::NAN, 0.0, 0.0);
        assert_eq!(arc_power_kw(&nan, &voltage), 0.0);
    }

    #[test]
    fn gap_leaves_energy_unchanged() {
        let current = PhaseValues::new(1000.0, 1000.0, 1000.0);
        let voltage = PhaseValues::new(100.0, 100.0, 100.0);
        let t0 = Utc::now();

        let mut gap = EnergyCalculator::new();
        gap.update(&current, &voltage, t0);
        let after = gap.update(&current, &voltage, t0 + Duration::seconds(10_000));
        assert_eq!(after.energy_total, 0.0);

        let mut normal = EnergyCalculator::new();
        normal.update(&current, &voltage, t0);
        let after = normal.update(&current, &voltage, t0 + Duration::seconds(5));
        let expected = 255.0 * 5.0 / 3600.0;
        assert!((after.energy_total - expected).abs() < 1e-9);
    }
}
