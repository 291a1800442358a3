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
use smelt_common::time::seconds_between;

/// Longest interval that is still integrated. Anything longer is a gap.
pub const GAP_THRESHOLD_SECS: f64 = 30.0;

/// Wall-clock step source shared by the time integrators.
///
/// The first sample, the first sample after [`IntegrationClock::reset`] and
/// the first sample after a gap only arm the clock.
#[derive(Debug, Clone, Default)]
pub struct IntegrationClock {
    last: Option<DateTime<Utc>>,
    gaps: u64,
}

impl IntegrationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to `now` and return the seconds to integrate, if any.
    pub fn step(&mut self, now: DateTime<Utc>) -> Option<f64> {
        let previous = self.last.replace(now)?;
        let dt = seconds_between(previous, now);
        if dt > GAP_THRESHOLD_SECS {
            self.gaps += 1;
            return None;
        }
        (dt > 0.0).then_some(dt)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Number of intervals skipped as gaps.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}

/// Whether an externally supplied interval may be integrated.
pub fn integrable(dt_secs: f64) -> bool {
    dt_secs.is_finite() && dt_secs > 0.0 && dt_secs <= GAP_THRESHOLD_SECS
}
