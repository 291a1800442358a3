//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Derived-value calculators for the furnace pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Stateful transforms applied to decoded PLC readings: arc power and energy,
//! cooling-water volumes, valve openness and hopper feeding.
//!
//! Each calculator owns its accumulator. [`Calculators`] groups them behind
//! individual locks so the polling loops and the batch hooks can share one set.

pub mod clock;
pub mod cooling;
pub mod energy;
pub mod feeding;
pub mod valve;

use parking_lot::Mutex;
use smelt_common::ValveSettings;

pub use clock::{IntegrationClock, GAP_THRESHOLD_SECS};
pub use cooling::{pressure_diff, CoolingCalculator, CoolingTotals};
pub use energy::{arc_power_kw, EnergyCalculator, EnergyReading, ARC_POWER_FACTOR};
pub use feeding::{effective_upper_limit, FeedingAccumulator, DEFAULT_UPPER_LIMIT_KG};
pub use valve::{ValveMotion, ValveOpennessCalculator, ValveState};

/// The calculator set of one furnace.
#[derive(Debug, Default)]
pub struct Calculators {
    pub energy: Mutex<EnergyCalculator>,
    pub cooling: Mutex<CoolingCalculator>,
    pub valves: Mutex<ValveOpennessCalculator>,
    pub feeding: Mutex<FeedingAccumulator>,
}

impl Calculators {
    pub fn new(valve_settings: ValveSettings) -> Self {
        Self {
            valves: Mutex::new(ValveOpennessCalculator::new(valve_settings)),
            ..Self::default()
        }
    }

    /// Reset the batch-scoped accumulators. Energy and valve openness carry over.
    pub fn reset_batch_totals(&self) {
        self.cooling.lock().reset();
        self.feeding.lock().reset();
    }
}
