//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Byte layout of the furnace PLC data blocks. All multi-byte values are big-endian.
//!
//! DB1, DB18 and DB32 follow the PLC program. The DB19 hopper counters and the
//! DB30/DB41 device words are site inputs; keep them in sync with the PLC project
//! when it changes.

/// Arc measurements, setpoints and emergency-stop parameters.
pub const DB_ARC: u16 = 1;
/// Hopper parameters (upper limit).
pub const DB_HOPPER_LIMIT: u16 = 18;
/// Hopper feeding counters and state.
pub const DB_HOPPER: u16 = 19;
/// Device communication flags.
pub const DB_DEVICE_COMM: u16 = 30;
/// Sensor block.
pub const DB_SENSOR: u16 = 32;
/// Device status words.
pub const DB_DEVICE_STATUS: u16 = 41;

pub mod db1 {
    /// Arc current U/V/W, INT amps.
    pub const ARC_CURRENT: [usize; 3] = [0, 2, 4];
    /// Arc voltage U/V/W, REAL volts.
    pub const ARC_VOLTAGE: [usize; 3] = [6, 10, 14];
    /// Current setpoint U/V/W, INT amps.
    pub const SETPOINT: [usize; 3] = [18, 20, 22];
    /// Manual deadzone, REAL percent.
    pub const DEADZONE_PERCENT: usize = 24;
    /// Emergency-stop flag byte.
    pub const EMERGENCY_BITS: usize = 180;
    pub const EMERGENCY_FLAG_BIT: u8 = 0;
    pub const EMERGENCY_ENABLED_BIT: u8 = 1;
    /// Arc-limit setpoint, INT amps.
    pub const ARC_LIMIT: usize = 182;
    /// Emergency-stop debounce delay, TIME (DInt milliseconds). 184..186 is reserved.
    pub const EMERGENCY_DELAY: usize = 186;
    pub const SIZE: usize = 190;
}

pub mod db18 {
    /// Hopper upper limit, DInt kg.
    pub const UPPER_LIMIT: usize = 40;
    pub const SIZE: usize = 4;
}

pub mod db19 {
    /// Raw cumulative feeding counter, REAL kg.
    pub const FEEDING_COUNTER: usize = 0;
    /// Weight of the current discharge, REAL kg.
    pub const DISCHARGE_WEIGHT: usize = 4;
    /// Hopper state byte.
    pub const STATE: usize = 8;
    pub const SIZE: usize = 10;
}

pub mod db32 {
    /// Electrode depth LENTH1..3, REAL mm.
    pub const ELECTRODE_DEPTH: [usize; 3] = [0, 4, 8];
    /// WATER_PRESS_1/2, REAL.
    pub const WATER_PRESSURE: [usize; 2] = [12, 16];
    /// WATER_FLOW_1 (shell) / WATER_FLOW_2 (cover), REAL m³/h.
    pub const WATER_FLOW: [usize; 2] = [20, 24];
    /// Hopper weight, REAL kg.
    pub const HOPPER_WEIGHT: usize = 28;
    /// Two bits per valve: bit 2n close, bit 2n+1 open.
    pub const VALVE_STATUS: usize = 32;
    pub const DUST_BITS: usize = 33;
    pub const FAN_RUNNING_BIT: u8 = 0;
    pub const SIZE: usize = 36;
}

pub mod devices {
    /// Bytes per device entry in DB30/DB41.
    pub const STRIDE: usize = 4;
    pub const FLAGS: usize = 0;
    pub const STATUS: usize = 2;
    pub const DONE_BIT: u8 = 0;
    pub const BUSY_BIT: u8 = 1;
    pub const ERROR_BIT: u8 = 2;

    pub const DB30_DEVICES: [&str; 4] = [
        "arc_meter",
        "sensor_gateway",
        "hopper_scale",
        "dust_collector",
    ];
    pub const DB41_DEVICES: [&str; 4] = [
        "water_flow_1",
        "water_flow_2",
        "water_press_1",
        "water_press_2",
    ];

    /// Device names of a status block, if it is one.
    pub fn names(db: u16) -> Option<&'static [&'static str]> {
        match db {
            super::DB_DEVICE_COMM => Some(&DB30_DEVICES),
            super::DB_DEVICE_STATUS => Some(&DB41_DEVICES),
            _ => None,
        }
    }

    /// Bytes to read for a status block.
    pub fn size(db: u16) -> usize {
        names(db).map(|names| names.len() * STRIDE).unwrap_or(0)
    }
}
