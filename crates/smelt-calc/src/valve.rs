//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Derived-value calculators for the furnace pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Valve openness estimated from motor run direction.
//!
//! The valves have no position feedback. Openness is the time spent moving
//! in each direction divided by the calibrated full-travel time, clamped to
//! `[0, 100]`. Samples are buffered per valve and integrated in order once
//! [`COMMIT_EVERY`] samples are pending or on an explicit flush.

use chrono::{DateTime, Utc};
use serde::Serialize;
use smelt_common::{ValveConfig, ValveOpenness, ValveSettings, VALVE_COUNT};
use tracing::warn;

use crate::clock::{integrable, IntegrationClock};

/// Pending samples per valve that trigger an integration.
pub const COMMIT_EVERY: usize = 5;

/// Motor direction encoded by a valve's 2-bit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveMotion {
    Stopped,
    Closing,
    Opening,
    /// Both bits set. Treated as stopped.
    Invalid,
}

impl ValveMotion {
    /// `pair` is `(byte >> 2*(id-1)) & 0b11`: bit 0 close, bit 1 open.
    pub fn from_bits(pair: u8) -> Self {
        match pair & 0b11 {
            0b01 => ValveMotion::Closing,
            0b10 => ValveMotion::Opening,
            0b11 => ValveMotion::Invalid,
            _ => ValveMotion::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValveState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
    StoppedPartial,
}

#[derive(Debug, Clone, Default)]
struct ValveTrack {
    openness: f64,
    state: ValveState,
    pending: Vec<(ValveMotion, f64)>,
    invalid: bool,
}

impl ValveTrack {
    fn integrate(&mut self, config: &ValveConfig) {
        for (motion, dt) in self.pending.drain(..) {
            match motion {
                ValveMotion::Opening => {
                    self.openness =
                        (self.openness + 100.0 * dt / config.full_open_time_s).clamp(0.0, 100.0);
                    self.state = if self.openness >= 100.0 {
                        ValveState::Open
                    } else {
                        ValveState::Opening
                    };
                }
                ValveMotion::Closing => {
                    self.openness =
                        (self.openness - 100.0 * dt / config.full_close_time_s).clamp(0.0, 100.0);
                    self.state = if self.openness <= 0.0 {
                        ValveState::Closed
                    } else {
                        ValveState::Closing
                    };
                }
                ValveMotion::Stopped | ValveMotion::Invalid => {
                    self.state = if self.openness <= 0.0 {
                        ValveState::Closed
                    } else if self.openness >= 100.0 {
                        ValveState::Open
                    } else {
                        ValveState::StoppedPartial
                    };
                }
            }
        }
    }
}

/// Openness estimator for valves 1..=4.
#[derive(Debug, Clone)]
pub struct ValveOpennessCalculator {
    settings: ValveSettings,
    valves: [ValveTrack; VALVE_COUNT],
    clock: IntegrationClock,
}

impl Default for ValveOpennessCalculator {
    fn default() -> Self {
        Self::new(ValveSettings::default())
    }
}

impl ValveOpennessCalculator {
    pub fn new(settings: ValveSettings) -> Self {
        Self {
            settings,
            valves: Default::default(),
            clock: IntegrationClock::new(),
        }
    }

    pub fn settings(&self) -> ValveSettings {
        self.settings
    }

    /// Replace one valve's calibration. Pending samples are integrated with the
    /// old calibration first. Returns false for an unknown valve or invalid times.
    pub fn set_config(&mut self, valve_id: usize, config: ValveConfig) -> bool {
        if !config.is_valid() || self.settings.get(valve_id).is_none() {
            return false;
        }
        self.flush_valve_openness_buffers();
        if let Some(slot) = self.settings.get_mut(valve_id) {
            *slot = config;
        }
        true
    }

    /// Queue one sample for `valve_id` (1-based): its 2-bit pair and the seconds
    /// since its previous sample. Intervals that are not finite, not positive or
    /// longer than the gap threshold still update the motion state but move nothing.
    pub fn add_valve_status(&mut self, valve_id: usize, pair: u8, dt_secs: f64) {
        let Some(index) = valve_id.checked_sub(1).filter(|index| *index < VALVE_COUNT) else {
            warn!(valve_id, "ignoring sample for unknown valve");
            return;
        };
        let motion = ValveMotion::from_bits(pair);
        let track = &mut self.valves[index];
        let invalid = motion == ValveMotion::Invalid;
        if invalid && !track.invalid {
            warn!(valve_id, "valve reports both open and close bits, treating as stopped");
        }
        track.invalid = invalid;

        let dt = if integrable(dt_secs) { dt_secs } else { 0.0 };
        track.pending.push((motion, dt));
        if track.pending.len() >= COMMIT_EVERY {
            let config = self.settings.valves[index];
            track.integrate(&config);
        }
    }

    /// Apply `(valve_id, pair, dt_secs)` samples in order.
    pub fn batch_add_valve_statuses(&mut self, samples: &[(usize, u8, f64)]) {
        for &(valve_id, pair, dt_secs) in samples {
            self.add_valve_status(valve_id, pair, dt_secs);
        }
    }

    /// Queue one DB32 status byte for all valves, timed by the wall clock.
    pub fn add_status_byte(&mut self, raw_byte: u8, now: DateTime<Utc>) {
        let dt = self.clock.step(now).unwrap_or(0.0);
        for valve_id in 1..=VALVE_COUNT {
            let pair = (raw_byte >> (2 * (valve_id - 1))) & 0b11;
            self.add_valve_status(valve_id, pair, dt);
        }
    }

    /// Integrate every pending sample and return the committed openness.
    pub fn flush_valve_openness_buffers(&mut self) -> ValveOpenness {
        for (track, config) in self.valves.iter_mut().zip(self.settings.valves.iter()) {
            track.integrate(config);
        }
        self.openness()
    }

    /// Committed openness. Samples still buffered are not included.
    pub fn openness(&self) -> ValveOpenness {
        let mut out = [0.0; VALVE_COUNT];
        for (slot, track) in out.iter_mut().zip(self.valves.iter()) {
            *slot = track.openness;
        }
        ValveOpenness(out)
    }

    pub fn state(&self, valve_id: usize) -> Option<ValveState> {
        valve_id
            .checked_sub(1)
            .and_then(|index| self.valves.get(index))
            .map(|track| track.state)
    }

    pub fn pending(&self) -> usize {
        self.valves.iter().map(|track| track.pending.len()).sum()
    }
}
