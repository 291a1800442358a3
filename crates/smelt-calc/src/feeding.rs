//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Derived-value calculators for the furnace pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Hopper discharge detection and the upper-limit fallback.

use chrono::{DateTime, Utc};
use smelt_common::FeedingRecord;
use tracing::{debug, info, warn};

/// Upper limit reported when the PLC value is unavailable or implausible.
pub const DEFAULT_UPPER_LIMIT_KG: i32 = 4900;
/// Largest upper limit considered plausible.
pub const MAX_UPPER_LIMIT_KG: i32 = 10_000;
/// Allowed gap between the PLC feeding counter and the detected total.
pub const COUNTER_TOLERANCE_KG: f64 = 1.0;

/// Resolve a raw DB18 upper limit to the value operators should see.
pub fn effective_upper_limit(raw: Option<i32>) -> i32 {
    match raw {
        Some(kg) if kg > 0 && kg <= MAX_UPPER_LIMIT_KG => kg,
        _ => DEFAULT_UPPER_LIMIT_KG,
    }
}

/// Edge-triggered discharge detector with a batch-scoped feeding total.
///
/// A record fires on the first nonzero discharge weight after a zero reading;
/// repeated nonzero reads of the same discharge are ignored. The edge state
/// is tracked even while no batch is active so a discharge that straddles
/// batch start is not counted.
///
/// The PLC's own cumulative feeding counter is tracked alongside and used as
/// a cross-check of the detected total; it never feeds the total itself.
#[derive(Debug, Clone, Default)]
pub struct FeedingAccumulator {
    discharging: bool,
    feeding_total: f64,
    records: u64,
    upper_limit_raw: Option<i32>,
    counter_baseline: Option<f64>,
    counter_latest: Option<f64>,
    drift_reported: bool,
}

impl FeedingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        discharge_weight: f64,
        batch_active: bool,
        now: DateTime<Utc>,
    ) -> Option<FeedingRecord> {
        let nonzero = discharge_weight > 0.0;
        let rising = nonzero && !self.discharging;
        self.discharging = nonzero;
        let record = match (rising, batch_active) {
            (false, _) => None,
            (true, false) => {
                debug!(discharge_weight, "discharge outside a batch, not recorded");
                None
            }
            (true, true) => {
                self.feeding_total += discharge_weight;
                self.records += 1;
                info!(discharge_weight, feeding_total = self.feeding_total, "feeding record");
                Some(FeedingRecord {
                    timestamp: now,
                    discharge_weight,
                })
            }
        };
        self.check_counter_drift();
        record
    }

    /// Feed the DB19 cumulative counter of this cycle, before [`update`](Self::update).
    ///
    /// The first reading inside a batch becomes its baseline. A counter that
    /// goes backwards (PLC restart) is rebased so the detected total still
    /// lines up. Once the hopper is settled after an update, a gap above
    /// [`COUNTER_TOLERANCE_KG`] is logged once per batch.
    pub fn observe_counter(&mut self, counter: f64, batch_active: bool) {
        if !counter.is_finite() {
            return;
        }
        self.counter_latest = Some(counter);
        if !batch_active {
            self.counter_baseline = None;
            return;
        }
        match self.counter_baseline {
            None => self.counter_baseline = Some(counter),
            Some(baseline) if counter < baseline => {
                warn!(baseline, counter, "PLC feeding counter went backwards, rebasing");
                self.counter_baseline = Some(counter - self.feeding_total);
            }
            Some(_) => {}
        }
    }

    fn check_counter_drift(&mut self) {
        if self.discharging || self.drift_reported {
            return;
        }
        if let Some(drift) = self.counter_drift() {
            if drift.abs() > COUNTER_TOLERANCE_KG {
                self.drift_reported = true;
                warn!(
                    drift,
                    feeding_total = self.feeding_total,
                    "detected feeding total disagrees with the PLC counter"
                );
            }
        }
    }

    /// Weight the PLC counted since the batch baseline.
    pub fn plc_counted_since_start(&self) -> Option<f64> {
        Some(self.counter_latest? - self.counter_baseline?)
    }

    /// PLC-counted weight minus the detected total.
    pub fn counter_drift(&self) -> Option<f64> {
        self.plc_counted_since_start()
            .map(|counted| counted - self.feeding_total)
    }

    /// Zero the batch total at batch start.
    pub fn reset(&mut self) {
        self.feeding_total = 0.0;
        self.records = 0;
        self.counter_baseline = None;
        self.drift_reported = false;
    }

    pub fn feeding_total(&self) -> f64 {
        self.feeding_total
    }

    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Store the latest DB18 read; `None` when it failed.
    pub fn set_upper_limit_raw(&mut self, raw: Option<i32>) {
        self.upper_limit_raw = raw;
    }

    pub fn upper_limit_raw(&self) -> Option<i32> {
        self.upper_limit_raw
    }

    pub fn hopper_upper_limit(&self) -> i32 {
        effective_upper_limit(self.upper_limit_raw)
    }
}
