//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batch-tagged time-series history for the furnace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Mapping from typed snapshots to single-field time-series points.
//!
//! Every physical quantity becomes its own series, tagged with the batch code,
//! the module it belongs to and, where it applies, the device or phase.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use smelt_common::{ArcSnapshot, FeedingRecord, Phase, SensorSnapshot};
use strum::{AsRefStr, Display};

pub const TAG_BATCH_CODE: &str = "batch_code";
pub const TAG_MODULE_TYPE: &str = "module_type";
pub const TAG_DEVICE_TYPE: &str = "device_type";

/// Measurement holding discrete feeding events.
pub const FEEDING_MEASUREMENT: &str = "feeding_records";
pub const FIELD_DISCHARGE_WEIGHT: &str = "discharge_weight";

pub mod fields {
    pub const ARC_CURRENT: [&str; 3] = ["arc_current_U", "arc_current_V", "arc_current_W"];
    pub const ARC_VOLTAGE: [&str; 3] = ["arc_voltage_U", "arc_voltage_V", "arc_voltage_W"];
    pub const SETPOINT: [&str; 3] = ["setpoint_U", "setpoint_V", "setpoint_W"];
    pub const DEADZONE: &str = "manual_deadzone_percent";
    pub const POWER_TOTAL: &str = "power_total";
    pub const ENERGY_TOTAL: &str = "energy_total";

    pub const ELECTRODE_DEPTH: [&str; 3] = ["LENTH1", "LENTH2", "LENTH3"];

    pub const WATER_FLOW: [&str; 2] = ["water_flow_1", "water_flow_2"];
    pub const WATER_PRESS: [&str; 2] = ["water_press_1", "water_press_2"];
    pub const PRESSURE_DIFF: &str = "pressure_diff";
    pub const SHELL_TOTAL: &str = "shell_total";
    pub const COVER_TOTAL: &str = "cover_total";

    pub const HOPPER_WEIGHT: &str = "hopper_weight";
    pub const FEEDING_TOTAL: &str = "feeding_total";
    pub const UPPER_LIMIT: &str = "upper_limit";

    pub const VALVE_OPENNESS: [&str; 4] = [
        "valve_openness_1",
        "valve_openness_2",
        "valve_openness_3",
        "valve_openness_4",
    ];

    pub const FAN_RUNNING: &str = "fan_running";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ModuleType {
    ArcData,
    ElectrodeDepth,
    CoolingWater,
    Hopper,
    Valve,
    DustCollector,
}

/// One value of one series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub field: String,
    pub value: f64,
    pub time: DateTime<Utc>,
}

impl Point {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

struct PointBuilder<'a> {
    measurement: &'a str,
    batch_code: &'a str,
    time: DateTime<Utc>,
    points: Vec<Point>,
}

impl<'a> PointBuilder<'a> {
    fn new(measurement: &'a str, batch_code: &'a str, time: DateTime<Utc>) -> Self {
        Self {
            measurement,
            batch_code,
            time,
            points: Vec::new(),
        }
    }

    fn push(&mut self, module: ModuleType, device: Option<&str>, field: &str, value: f64) {
        // line protocol cannot carry NaN or infinities
        if !value.is_finite() {
            return;
        }
        let mut tags = BTreeMap::new();
        tags.insert(TAG_BATCH_CODE.to_owned(), self.batch_code.to_owned());
        tags.insert(TAG_MODULE_TYPE.to_owned(), module.to_string());
        if let Some(device) = device {
            tags.insert(TAG_DEVICE_TYPE.to_owned(), device.to_owned());
        }
        self.points.push(Point {
            measurement: self.measurement.to_owned(),
            tags,
            field: field.to_owned(),
            value,
            time: self.time,
        });
    }
}

fn phase_device(phase: Phase) -> String {
    format!("phase_{phase}")
}

/// Points for one arc cycle.
pub fn arc_points(measurement: &str, batch_code: &str, snapshot: &ArcSnapshot) -> Vec<Point> {
    let mut builder = PointBuilder::new(measurement, batch_code, snapshot.timestamp);
    for (index, (phase, amps)) in snapshot.arc_current.iter().enumerate() {
        let device = phase_device(phase);
        builder.push(ModuleType::ArcData, Some(device.as_str()), fields::ARC_CURRENT[index], amps);
        builder.push(
            ModuleType::ArcData,
            Some(device.as_str()),
            fields::ARC_VOLTAGE[index],
            snapshot.arc_voltage.get(phase),
        );
        builder.push(
            ModuleType::ArcData,
            Some(device.as_str()),
            fields::SETPOINT[index],
            snapshot.setpoints.get(phase),
        );
    }
    builder.push(
        ModuleType::ArcData,
        None,
        fields::DEADZONE,
        snapshot.manual_deadzone_percent,
    );
    builder.push(ModuleType::ArcData, None, fields::POWER_TOTAL, snapshot.power_total);
    builder.push(ModuleType::ArcData, None, fields::ENERGY_TOTAL, snapshot.energy_total);
    builder.points
}

/// Points for one sensor cycle.
pub fn sensor_points(measurement: &str, batch_code: &str, snapshot: &SensorSnapshot) -> Vec<Point> {
    let mut builder = PointBuilder::new(measurement, batch_code, snapshot.timestamp);
    for (&name, depth) in fields::ELECTRODE_DEPTH
        .iter()
        .zip(snapshot.electrode_depths.as_array())
    {
        builder.push(ModuleType::ElectrodeDepth, Some(name), name, depth);
    }

    let cooling = &snapshot.cooling;
    builder.push(
        ModuleType::CoolingWater,
        Some("shell"),
        fields::WATER_FLOW[0],
        cooling.water_flow_1,
    );
    builder.push(
        ModuleType::CoolingWater,
        Some("cover"),
        fields::WATER_FLOW[1],
        cooling.water_flow_2,
    );
    builder.push(
        ModuleType::CoolingWater,
        Some("shell"),
        fields::WATER_PRESS[0],
        cooling.water_press_1,
    );
    builder.push(
        ModuleType::CoolingWater,
        Some("cover"),
        fields::WATER_PRESS[1],
        cooling.water_press_2,
    );
    builder.push(ModuleType::CoolingWater, None, fields::PRESSURE_DIFF, cooling.pressure_diff);
    builder.push(ModuleType::CoolingWater, Some("shell"), fields::SHELL_TOTAL, cooling.shell_total);
    builder.push(ModuleType::CoolingWater, Some("cover"), fields::COVER_TOTAL, cooling.cover_total);

    let hopper = &snapshot.hopper;
    builder.push(ModuleType::Hopper, None, fields::HOPPER_WEIGHT, hopper.weight);
    builder.push(ModuleType::Hopper, None, fields::FEEDING_TOTAL, hopper.feeding_total);
    builder.push(
        ModuleType::Hopper,
        None,
        fields::UPPER_LIMIT,
        f64::from(hopper.upper_limit),
    );

    for (index, openness) in snapshot.valve_openness.0.iter().enumerate() {
        let device = format!("valve_{}", index + 1);
        builder.push(
            ModuleType::Valve,
            Some(device.as_str()),
            fields::VALVE_OPENNESS[index],
            *openness,
        );
    }
    builder.push(
        ModuleType::DustCollector,
        None,
        fields::FAN_RUNNING,
        if snapshot.dust_collector.fan_running { 1.0 } else { 0.0 },
    );
    builder.points
}

/// The point recording one discharge.
pub fn feeding_point(batch_code: &str, record: &FeedingRecord) -> Vec<Point> {
    let mut builder = PointBuilder::new(FEEDING_MEASUREMENT, batch_code, record.timestamp);
    builder.push(
        ModuleType::Hopper,
        None,
        FIELD_DISCHARGE_WEIGHT,
        record.discharge_weight,
    );
    builder.points
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_common::{EmergencyStop, PhaseValues};

    #[test]
    fn arc_cycle_becomes_one_series_per_quantity() {
        let snapshot = ArcSnapshot {
            arc_current: PhaseValues::new(5000.0, 5100.0, f64::NAN),
            arc_voltage: PhaseValues::new(90.0, 91.0, 92.0),
            setpoints: PhaseValues::new(5200.0, 5200.0, 5200.0),
            manual_deadzone_percent: 5.0,
            power_total: 1000.0,
            energy_total: 12.5,
            emergency_stop: EmergencyStop::default(),
            timestamp: Utc::now(),
        };
        let points = arc_points("sensor_data", "B-7", &snapshot);
        // 9 phase fields minus the NaN current, plus deadzone, power, energy
        assert_eq!(points.len(), 11);
        let current_u = points.iter().find(|p| p.field == "arc_current_U").unwrap();
        assert_eq!(current_u.value, 5000.0);
        assert_eq!(current_u.tag(TAG_BATCH_CODE), Some("B-7"));
        assert_eq!(current_u.tag(TAG_MODULE_TYPE), Some("arc_data"));
        assert_eq!(current_u.tag(TAG_DEVICE_TYPE), Some("phase_U"));
        assert!(points.iter().all(|p| p.field != "arc_current_W"));
        let energy = points.iter().find(|p| p.field == "energy_total").unwrap();
        assert_eq!(energy.tag(TAG_DEVICE_TYPE), None);
    }

    #[test]
    fn feeding_records_use_their_own_measurement() {
        let record = FeedingRecord {
            timestamp: Utc::now(),
            discharge_weight: 120.0,
        };
        let points = feeding_point("B-7", &record);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, FEEDING_MEASUREMENT);
        assert_eq!(points[0].field, FIELD_DISCHARGE_WEIGHT);
        assert_eq!(points[0].tag(TAG_MODULE_TYPE), Some("hopper"));
    }
}
