//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Pure decoding of raw data-block bytes into typed register values.
//!
//! Every decoder checks that the buffer covers each declared offset and fails
//! with [`DecodeError::ShortBuffer`] otherwise. Enum-like bytes are returned as
//! raw integers; interpreting them is left to the calculators.

use indexmap::IndexMap;
use serde::Serialize;
use smelt_common::DeviceStatus;

use crate::error::DecodeError;
use crate::register_map::{
    db1, db19, db32, devices, DB_ARC, DB_HOPPER, DB_HOPPER_LIMIT, DB_SENSOR,
};

/// Bounds-checked big-endian reader over one data block.
#[derive(Debug, Clone, Copy)]
pub struct BlockReader<'a> {
    db: u16,
    buf: &'a [u8],
}

impl<'a> BlockReader<'a> {
    pub fn new(db: u16, buf: &'a [u8]) -> Self {
        Self { db, buf }
    }

    fn take<const N: usize>(
        &self,
        field: &'static str,
        offset: usize,
    ) -> Result<[u8; N], DecodeError> {
        offset
            .checked_add(N)
            .and_then(|end| self.buf.get(offset..end))
            .and_then(|slice| <[u8; N]>::try_from(slice).ok())
            .ok_or(DecodeError::ShortBuffer {
                db: self.db,
                field,
                offset,
                needed: offset.saturating_add(N),
                len: self.buf.len(),
            })
    }

    pub fn u8(&self, field: &'static str, offset: usize) -> Result<u8, DecodeError> {
        Ok(self.take::<1>(field, offset)?[0])
    }

    pub fn bit(&self, field: &'static str, offset: usize, bit: u8) -> Result<bool, DecodeError> {
        Ok((self.u8(field, offset)? >> bit) & 1 == 1)
    }

    pub fn i16(&self, field: &'static str, offset: usize) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.take(field, offset)?))
    }

    pub fn u16(&self, field: &'static str, offset: usize) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(field, offset)?))
    }

    pub fn i32(&self, field: &'static str, offset: usize) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take(field, offset)?))
    }

    pub fn f32(&self, field: &'static str, offset: usize) -> Result<f32, DecodeError> {
        Ok(f32::from_be_bytes(self.take(field, offset)?))
    }
}

/// Big-endian encoder used by the simulator and by write requests.
#[derive(Debug, Clone, Default)]
pub struct BlockWriter {
    buf: Vec<u8>,
}

impl BlockWriter {
    pub fn new(size: usize) -> Self {
        Self { buf: vec![0; size] }
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) -> &mut Self {
        let end = offset + bytes.len();
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(bytes);
        self
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) -> &mut Self {
        self.put(offset, &[value])
    }

    pub fn put_bit(&mut self, offset: usize, bit: u8, on: bool) -> &mut Self {
        let current = self.buf.get(offset).copied().unwrap_or(0);
        let mask = 1u8 << bit;
        let next = if on { current | mask } else { current & !mask };
        self.put_u8(offset, next)
    }

    pub fn put_i16(&mut self, offset: usize, value: i16) -> &mut Self {
        self.put(offset, &value.to_be_bytes())
    }

    pub fn put_u16(&mut self, offset: usize, value: u16) -> &mut Self {
        self.put(offset, &value.to_be_bytes())
    }

    pub fn put_i32(&mut self, offset: usize, value: i32) -> &mut Self {
        self.put(offset, &value.to_be_bytes())
    }

    pub fn put_f32(&mut self, offset: usize, value: f32) -> &mut Self {
        self.put(offset, &value.to_be_bytes())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Raw DB1 content.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ArcRaw {
    pub current: [i16; 3],
    pub voltage: [f32; 3],
    pub setpoint: [i16; 3],
    pub deadzone_percent: f32,
    pub emergency_flag: bool,
    pub emergency_enabled: bool,
    pub arc_limit: i16,
    pub emergency_delay_ms: i32,
}

/// Raw DB32 content.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorRaw {
    pub electrode_depth_mm: [f32; 3],
    pub water_pressure: [f32; 2],
    pub water_flow: [f32; 2],
    pub hopper_weight: f32,
    pub valve_byte: u8,
    pub fan_running: bool,
}

/// Raw DB19 content.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HopperRaw {
    pub feeding_counter: f32,
    pub discharge_weight: f32,
    pub state: u8,
}

const PHASE_CURRENT: [&str; 3] = ["arc_current_U", "arc_current_V", "arc_current_W"];
const PHASE_VOLTAGE: [&str; 3] = ["arc_voltage_U", "arc_voltage_V", "arc_voltage_W"];
const PHASE_SETPOINT: [&str; 3] = ["setpoint_U", "setpoint_V", "setpoint_W"];
const ELECTRODES: [&str; 3] = ["LENTH1", "LENTH2", "LENTH3"];
const PRESSURES: [&str; 2] = ["WATER_PRESS_1", "WATER_PRESS_2"];
const FLOWS: [&str; 2] = ["WATER_FLOW_1", "WATER_FLOW_2"];

pub fn decode_arc_block(buf: &[u8]) -> Result<ArcRaw, DecodeError> {
    let r = BlockReader::new(DB_ARC, buf);
    let mut raw = ArcRaw::default();
    for i in 0..3 {
        raw.current[i] = r.i16(PHASE_CURRENT[i], db1::ARC_CURRENT[i])?;
        raw.voltage[i] = r.f32(PHASE_VOLTAGE[i], db1::ARC_VOLTAGE[i])?;
        raw.setpoint[i] = r.i16(PHASE_SETPOINT[i], db1::SETPOINT[i])?;
    }
    raw.deadzone_percent = r.f32("manual_deadzone_percent", db1::DEADZONE_PERCENT)?;
    raw.emergency_flag = r.bit(
        "emergency_flag",
        db1::EMERGENCY_BITS,
        db1::EMERGENCY_FLAG_BIT,
    )?;
    raw.emergency_enabled = r.bit(
        "emergency_enabled",
        db1::EMERGENCY_BITS,
        db1::EMERGENCY_ENABLED_BIT,
    )?;
    raw.arc_limit = r.i16("arc_limit", db1::ARC_LIMIT)?;
    raw.emergency_delay_ms = r.i32("emergency_delay_ms", db1::EMERGENCY_DELAY)?;
    Ok(raw)
}

pub fn encode_arc_block(raw: &ArcRaw) -> Vec<u8> {
    let mut w = BlockWriter::new(db1::SIZE);
    for i in 0..3 {
        w.put_i16(db1::ARC_CURRENT[i], raw.current[i])
            .put_f32(db1::ARC_VOLTAGE[i], raw.voltage[i])
            .put_i16(db1::SETPOINT[i], raw.setpoint[i]);
    }
    w.put_f32(db1::DEADZONE_PERCENT, raw.deadzone_percent)
        .put_bit(
            db1::EMERGENCY_BITS,
            db1::EMERGENCY_FLAG_BIT,
            raw.emergency_flag,
        )
        .put_bit(
            db1::EMERGENCY_BITS,
            db1::EMERGENCY_ENABLED_BIT,
            raw.emergency_enabled,
        )
        .put_i16(db1::ARC_LIMIT, raw.arc_limit)
        .put_i32(db1::EMERGENCY_DELAY, raw.emergency_delay_ms);
    w.into_bytes()
}

pub fn decode_sensor_block(buf: &[u8]) -> Result<SensorRaw, DecodeError> {
    let r = BlockReader::new(DB_SENSOR, buf);
    let mut raw = SensorRaw::default();
    for i in 0..3 {
        raw.electrode_depth_mm[i] = r.f32(ELECTRODES[i], db32::ELECTRODE_DEPTH[i])?;
    }
    for i in 0..2 {
        raw.water_pressure[i] = r.f32(PRESSURES[i], db32::WATER_PRESSURE[i])?;
        raw.water_flow[i] = r.f32(FLOWS[i], db32::WATER_FLOW[i])?;
    }
    raw.hopper_weight = r.f32("hopper_weight", db32::HOPPER_WEIGHT)?;
    raw.valve_byte = r.u8("valve_status", db32::VALVE_STATUS)?;
    raw.fan_running = r.bit("fan_running", db32::DUST_BITS, db32::FAN_RUNNING_BIT)?;
    Ok(raw)
}

pub fn encode_sensor_block(raw: &SensorRaw) -> Vec<u8> {
    let mut w = BlockWriter::new(db32::SIZE);
    for i in 0..3 {
        w.put_f32(db32::ELECTRODE_DEPTH[i], raw.electrode_depth_mm[i]);
    }
    for i in 0..2 {
        w.put_f32(db32::WATER_PRESSURE[i], raw.water_pressure[i])
            .put_f32(db32::WATER_FLOW[i], raw.water_flow[i]);
    }
    w.put_f32(db32::HOPPER_WEIGHT, raw.hopper_weight)
        .put_u8(db32::VALVE_STATUS, raw.valve_byte)
        .put_bit(db32::DUST_BITS, db32::FAN_RUNNING_BIT, raw.fan_running);
    w.into_bytes()
}

pub fn decode_hopper_block(buf: &[u8]) -> Result<HopperRaw, DecodeError> {
    let r = BlockReader::new(DB_HOPPER, buf);
    Ok(HopperRaw {
        feeding_counter: r.f32("feeding_counter", db19::FEEDING_COUNTER)?,
        discharge_weight: r.f32("discharge_weight", db19::DISCHARGE_WEIGHT)?,
        state: r.u8("hopper_state", db19::STATE)?,
    })
}

pub fn encode_hopper_block(raw: &HopperRaw) -> Vec<u8> {
    let mut w = BlockWriter::new(db19::SIZE);
    w.put_f32(db19::FEEDING_COUNTER, raw.feeding_counter)
        .put_f32(db19::DISCHARGE_WEIGHT, raw.discharge_weight)
        .put_u8(db19::STATE, raw.state);
    w.into_bytes()
}

/// Decode the hopper upper limit from a read that starts at DB18 offset 40.
pub fn decode_upper_limit(buf: &[u8]) -> Result<i32, DecodeError> {
    BlockReader::new(DB_HOPPER_LIMIT, buf).i32("hopper_upper_limit", 0)
}

/// Decode a DB30/DB41 device table.
pub fn decode_device_block(db: u16, buf: &[u8]) -> Result<Vec<DeviceStatus>, DecodeError> {
    let names = devices::names(db).ok_or(DecodeError::UnknownBlock { db })?;
    let r = BlockReader::new(db, buf);
    names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let base = index * devices::STRIDE;
            let flags = r.u8("device_flags", base + devices::FLAGS)?;
            Ok(DeviceStatus {
                block: db,
                device_name: (*name).to_owned(),
                done: (flags >> devices::DONE_BIT) & 1 == 1,
                busy: (flags >> devices::BUSY_BIT) & 1 == 1,
                error: (flags >> devices::ERROR_BIT) & 1 == 1,
                status: r.u16("device_status", base + devices::STATUS)?,
            })
        })
        .collect()
}

pub fn encode_device_block(db: u16, entries: &[DeviceStatus]) -> Vec<u8> {
    let mut w = BlockWriter::new(devices::size(db));
    for (index, entry) in entries.iter().enumerate() {
        let base = index * devices::STRIDE;
        w.put_bit(base + devices::FLAGS, devices::DONE_BIT, entry.done)
            .put_bit(base + devices::FLAGS, devices::BUSY_BIT, entry.busy)
            .put_bit(base + devices::FLAGS, devices::ERROR_BIT, entry.error)
            .put_u16(base + devices::STATUS, entry.status);
    }
    w.into_bytes()
}

/// The 2-bit motor state of one valve inside the DB32 status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveBits {
    /// `(byte >> 2*(id-1)) & 0b11`.
    pub pair: u8,
    pub close_bit: u8,
    pub open_bit: u8,
}

/// Extract the bit pair of `valve_id` (1..=4).
pub fn valve_bits(byte: u8, valve_id: usize) -> Option<ValveBits> {
    if !(1..=4).contains(&valve_id) {
        return None;
    }
    let shift = 2 * (valve_id as u32 - 1);
    let pair = (byte >> shift) & 0b11;
    Some(ValveBits {
        pair,
        close_bit: pair & 0b1,
        open_bit: (byte >> (shift + 1)) & 0b1,
    })
}

/// Pack `(close, open)` flags for valves 1..=4 into one status byte.
pub fn pack_valve_byte(flags: [(bool, bool); 4]) -> u8 {
    flags
        .iter()
        .enumerate()
        .fold(0u8, |acc, (index, (close, open))| {
            let pair = u8::from(*close) | (u8::from(*open) << 1);
            acc | (pair << (2 * index))
        })
}

/// Flat register value for diagnostics views.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Int(i64),
    Real(f64),
    Bool(bool),
}

/// Decode any known block into a flat `field -> value` map.
pub fn decode_block(db: u16, buf: &[u8]) -> Result<IndexMap<String, RegisterValue>, DecodeError> {
    let mut fields = IndexMap::new();
    match db {
        DB_ARC => {
            let raw = decode_arc_block(buf)?;
            for i in 0..3 {
                fields.insert(PHASE_CURRENT[i].to_owned(), RegisterValue::Int(raw.current[i].into()));
                fields.insert(PHASE_VOLTAGE[i].to_owned(), RegisterValue::Real(raw.voltage[i].into()));
                fields.insert(PHASE_SETPOINT[i].to_owned(), RegisterValue::Int(raw.setpoint[i].into()));
            }
            fields.insert(
                "manual_deadzone_percent".to_owned(),
                RegisterValue::Real(raw.deadzone_percent.into()),
            );
            fields.insert("emergency_flag".to_owned(), RegisterValue::Bool(raw.emergency_flag));
            fields.insert(
                "emergency_enabled".to_owned(),
                RegisterValue::Bool(raw.emergency_enabled),
            );
            fields.insert("arc_limit".to_owned(), RegisterValue::Int(raw.arc_limit.into()));
            fields.insert(
                "emergency_delay_ms".to_owned(),
                RegisterValue::Int(raw.emergency_delay_ms.into()),
            );
        }
        DB_SENSOR => {
            let raw = decode_sensor_block(buf)?;
            for i in 0..3 {
                fields.insert(
                    ELECTRODES[i].to_owned(),
                    RegisterValue::Real(raw.electrode_depth_mm[i].into()),
                );
            }
            for i in 0..2 {
                fields.insert(PRESSURES[i].to_owned(), RegisterValue::Real(raw.water_pressure[i].into()));
                fields.insert(FLOWS[i].to_owned(), RegisterValue::Real(raw.water_flow[i].into()));
            }
            fields.insert("hopper_weight".to_owned(), RegisterValue::Real(raw.hopper_weight.into()));
            fields.insert("valve_status".to_owned(), RegisterValue::Int(raw.valve_byte.into()));
            for valve_id in 1..=4 {
                if let Some(bits) = valve_bits(raw.valve_byte, valve_id) {
                    fields.insert(
                        format!("valve_{valve_id}_close"),
                        RegisterValue::Bool(bits.close_bit == 1),
                    );
                    fields.insert(
                        format!("valve_{valve_id}_open"),
                        RegisterValue::Bool(bits.open_bit == 1),
                    );
                }
            }
            fields.insert("fan_running".to_owned(), RegisterValue::Bool(raw.fan_running));
        }
        DB_HOPPER => {
            let raw = decode_hopper_block(buf)?;
            fields.insert(
                "feeding_counter".to_owned(),
                RegisterValue::Real(raw.feeding_counter.into()),
            );
            fields.insert(
                "discharge_weight".to_owned(),
                RegisterValue::Real(raw.discharge_weight.into()),
            );
            fields.insert("hopper_state".to_owned(), RegisterValue::Int(raw.state.into()));
        }
        DB_HOPPER_LIMIT => {
            fields.insert(
                "hopper_upper_limit".to_owned(),
                RegisterValue::Int(decode_upper_limit(buf)?.into()),
            );
        }
        other => {
            for device in decode_device_block(other, buf)? {
                let name = device.device_name;
                fields.insert(format!("{name}.done"), RegisterValue::Bool(device.done));
                fields.insert(format!("{name}.busy"), RegisterValue::Bool(device.busy));
                fields.insert(format!("{name}.error"), RegisterValue::Bool(device.error));
                fields.insert(format!("{name}.status"), RegisterValue::Int(device.status.into()));
            }
        }
    }
    Ok(fields)
}
