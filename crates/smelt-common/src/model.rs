//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Typed snapshot model shared by the acquisition pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Typed readings produced by one poll cycle of a PLC data block.
//!
//! Snapshots are built once per cycle and never mutated afterwards; the cache
//! hands out `Arc` clones so readers always see a fully-populated cycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Number of dust-collector valves on the furnace.
pub const VALVE_COUNT: usize = 4;

/// Electrical phase of one electrode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumIter, AsRefStr,
)]
pub enum Phase {
    U,
    V,
    W,
}

/// One value per phase.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseValues {
    #[serde(rename = "U")]
    pub u: f64,
    #[serde(rename = "V")]
    pub v: f64,
    #[serde(rename = "W")]
    pub w: f64,
}

impl PhaseValues {
    pub fn new(u: f64, v: f64, w: f64) -> Self {
        Self { u, v, w }
    }

    pub fn get(&self, phase: Phase) -> f64 {
        match phase {
            Phase::U => self.u,
            Phase::V => self.v,
            Phase::W => self.w,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Phase, f64)> {
        [(Phase::U, self.u), (Phase::V, self.v), (Phase::W, self.w)].into_iter()
    }
}

/// Emergency-stop configuration and state mirrored from DB1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmergencyStop {
    /// Arc-limit setpoint in amps.
    pub arc_limit: i32,
    /// Debounce delay before the stop fires, in milliseconds.
    pub delay_ms: i32,
    pub flag: bool,
    pub enabled: bool,
}

/// One reading cycle of DB1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcSnapshot {
    pub arc_current: PhaseValues,
    pub arc_voltage: PhaseValues,
    pub setpoints: PhaseValues,
    pub manual_deadzone_percent: f64,
    /// Instantaneous three-phase power, kW.
    pub power_total: f64,
    /// Process-lifetime energy accumulator, kWh.
    pub energy_total: f64,
    pub emergency_stop: EmergencyStop,
    pub timestamp: DateTime<Utc>,
}

impl ArcSnapshot {
    /// Lower and upper control limits around a phase setpoint.
    pub fn control_band(&self, phase: Phase) -> (f64, f64) {
        let setpoint = self.setpoints.get(phase);
        let band = setpoint * self.manual_deadzone_percent / 100.0;
        (setpoint - band, setpoint + band)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElectrodeDepth {
    pub distance_mm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElectrodeDepths {
    #[serde(rename = "LENTH1")]
    pub lenth1: ElectrodeDepth,
    #[serde(rename = "LENTH2")]
    pub lenth2: ElectrodeDepth,
    #[serde(rename = "LENTH3")]
    pub lenth3: ElectrodeDepth,
}

impl ElectrodeDepths {
    pub fn as_array(&self) -> [f64; 3] {
        [
            self.lenth1.distance_mm,
            self.lenth2.distance_mm,
            self.lenth3.distance_mm,
        ]
    }
}

/// Cooling-water readings. Circuit 1 cools the furnace shell, circuit 2 the cover.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CoolingWater {
    /// Shell circuit flow, m³/h.
    pub water_flow_1: f64,
    /// Cover circuit flow, m³/h.
    pub water_flow_2: f64,
    pub water_press_1: f64,
    pub water_press_2: f64,
    pub pressure_diff: f64,
    /// Cumulative shell volume within the batch, m³.
    pub shell_total: f64,
    /// Cumulative cover volume within the batch, m³.
    pub cover_total: f64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HopperState {
    #[default]
    Idle,
    Feeding,
    WaitingFeed,
    Discharging,
}

impl HopperState {
    /// Map the DB19 state byte. Unknown values fall back to idle.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => HopperState::Feeding,
            2 => HopperState::WaitingFeed,
            3 => HopperState::Discharging,
            _ => HopperState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HopperReading {
    /// Current hopper weight, kg.
    pub weight: f64,
    /// Material fed within the active batch, kg.
    pub feeding_total: f64,
    /// Effective upper limit, kg.
    pub upper_limit: i32,
    pub state: HopperState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValveStatus {
    pub raw_byte: u8,
}

/// Estimated openness percent of valves 1..=4.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ValveOpenness(pub [f64; VALVE_COUNT]);

impl ValveOpenness {
    /// Openness of `valve_id` (1-based).
    pub fn get(&self, valve_id: usize) -> Option<f64> {
        valve_id
            .checked_sub(1)
            .and_then(|index| self.0.get(index))
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DustCollector {
    pub fan_running: bool,
}

/// One reading cycle of DB32 plus the hopper blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub electrode_depths: ElectrodeDepths,
    pub cooling: CoolingWater,
    pub hopper: HopperReading,
    pub valve_status: ValveStatus,
    pub valve_openness: ValveOpenness,
    pub dust_collector: DustCollector,
    /// Mirror of the latest arc energy accumulator, kWh.
    pub energy_total: f64,
    pub timestamp: DateTime<Utc>,
}

/// Communication state of one field device reported through DB30/DB41.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub block: u16,
    pub device_name: String,
    pub done: bool,
    pub busy: bool,
    pub error: bool,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub devices: Vec<DeviceStatus>,
    pub plc_connected: bool,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn device(&self, name: &str) -> Option<&DeviceStatus> {
        self.devices.iter().find(|device| device.device_name == name)
    }
}

/// Smelting-run context supplied by the batch service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchStatus {
    pub is_smelting: bool,
    pub batch_code: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
}

impl BatchStatus {
    /// Batch code to tag persisted readings with, if a run is active.
    pub fn active_code(&self) -> Option<&str> {
        if self.is_smelting {
            self.batch_code.as_deref()
        } else {
            None
        }
    }
}

/// One detected hopper discharge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedingRecord {
    pub timestamp: DateTime<Utc>,
    pub discharge_weight: f64,
}

/// Full-travel calibration of a valve actuator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValveConfig {
    pub full_open_time_s: f64,
    pub full_close_time_s: f64,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            full_open_time_s: 30.0,
            full_close_time_s: 30.0,
        }
    }
}

impl ValveConfig {
    pub fn is_valid(&self) -> bool {
        self.full_open_time_s.is_finite()
            && self.full_close_time_s.is_finite()
            && self.full_open_time_s > 0.0
            && self.full_close_time_s > 0.0
    }
}

/// Calibration for all valves, persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ValveSettings {
    pub valves: [ValveConfig; VALVE_COUNT],
}

impl ValveSettings {
    pub fn get(&self, valve_id: usize) -> Option<&ValveConfig> {
        valve_id
            .checked_sub(1)
            .and_then(|index| self.valves.get(index))
    }

    pub fn get_mut(&mut self, valve_id: usize) -> Option<&mut ValveConfig> {
        valve_id
            .checked_sub(1)
            .and_then(|index| self.valves.get_mut(index))
    }
}

/// User-selectable refresh cadence of the arc loop while smelting.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
    EnumIter,
)]
pub enum PollingSpeed {
    #[serde(rename = "0.2s")]
    #[strum(serialize = "0.2s")]
    Fast,
    #[default]
    #[serde(rename = "0.5s")]
    #[strum(serialize = "0.5s")]
    Normal,
}

impl PollingSpeed {
    pub fn interval(&self) -> Duration {
        match self {
            PollingSpeed::Fast => Duration::from_millis(200),
            PollingSpeed::Normal => Duration::from_millis(500),
        }
    }
}
