//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Assembly of typed snapshots from decoded blocks and calculator state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Snapshot assembly. Each function takes one cycle's decoded blocks, feeds
//! the calculators and returns the finished snapshot; nothing here does I/O.

use chrono::{DateTime, Utc};
use smelt_calc::{pressure_diff, Calculators};
use smelt_common::{
    ArcSnapshot, CoolingWater, DeviceStatus, DustCollector, ElectrodeDepth, ElectrodeDepths,
    EmergencyStop, FeedingRecord, HopperReading, HopperState, PhaseValues, SensorSnapshot,
    StatusSnapshot, ValveStatus,
};
use smelt_plc::{ArcRaw, HopperRaw, SensorRaw};

fn phases<T: Copy + Into<f64>>(values: [T; 3]) -> PhaseValues {
    PhaseValues::new(values[0].into(), values[1].into(), values[2].into())
}

/// Build the DB1 snapshot and advance the energy integrator.
pub fn arc_snapshot(raw: &ArcRaw, calculators: &Calculators, now: DateTime<Utc>) -> ArcSnapshot {
    let arc_current = phases(raw.current);
    let arc_voltage = phases(raw.voltage);
    let energy = calculators
        .energy
        .lock()
        .update(&arc_current, &arc_voltage, now);
    ArcSnapshot {
        arc_current,
        arc_voltage,
        setpoints: phases(raw.setpoint),
        manual_deadzone_percent: f64::from(raw.deadzone_percent),
        power_total: energy.power_total,
        energy_total: energy.energy_total,
        emergency_stop: EmergencyStop {
            arc_limit: i32::from(raw.arc_limit),
            delay_ms: raw.emergency_delay_ms,
            flag: raw.emergency_flag,
            enabled: raw.emergency_enabled,
        },
        timestamp: now,
    }
}

/// Result of one DB32 cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorOutcome {
    pub snapshot: SensorSnapshot,
    /// Discharge detected in this cycle while a batch was running.
    pub feeding: Option<FeedingRecord>,
}

/// Build the DB32 snapshot.
///
/// `hopper` is the DB19 read of the same cycle; without it the hopper state
/// reads idle and no discharge can be detected. Valve openness is the
/// committed value, so buffered samples show up once they are integrated.
pub fn sensor_snapshot(
    raw: &SensorRaw,
    hopper: Option<&HopperRaw>,
    calculators: &Calculators,
    batch_active: bool,
    now: DateTime<Utc>,
) -> SensorOutcome {
    let [shell_flow, cover_flow] = raw.water_flow.map(f64::from);
    let [press_1, press_2] = raw.water_pressure.map(f64::from);
    let totals = calculators.cooling.lock().update(shell_flow, cover_flow, now);

    let valve_openness = {
        let mut valves = calculators.valves.lock();
        valves.add_status_byte(raw.valve_byte, now);
        valves.openness()
    };

    let (feeding, feeding_total, upper_limit) = {
        let mut accumulator = calculators.feeding.lock();
        let record = hopper.and_then(|hopper| {
            accumulator.observe_counter(f64::from(hopper.feeding_counter), batch_active);
            accumulator.update(f64::from(hopper.discharge_weight), batch_active, now)
        });
        (
            record,
            accumulator.feeding_total(),
            accumulator.hopper_upper_limit(),
        )
    };

    let energy_total = calculators.energy.lock().energy_total();
    let [d1, d2, d3] = raw.electrode_depth_mm.map(|mm| ElectrodeDepth {
        distance_mm: f64::from(mm),
    });

    let snapshot = SensorSnapshot {
        electrode_depths: ElectrodeDepths {
            lenth1: d1,
            lenth2: d2,
            lenth3: d3,
        },
        cooling: CoolingWater {
            water_flow_1: shell_flow,
            water_flow_2: cover_flow,
            water_press_1: press_1,
            water_press_2: press_2,
            pressure_diff: pressure_diff(press_1, press_2),
            shell_total: totals.shell_total,
            cover_total: totals.cover_total,
        },
        hopper: HopperReading {
            weight: f64::from(raw.hopper_weight),
            feeding_total,
            upper_limit,
            state: hopper.map_or(HopperState::Idle, |hopper| HopperState::from_raw(hopper.state)),
        },
        valve_status: ValveStatus {
            raw_byte: raw.valve_byte,
        },
        valve_openness,
        dust_collector: DustCollector {
            fan_running: raw.fan_running,
        },
        energy_total,
        timestamp: now,
    };
    SensorOutcome { snapshot, feeding }
}

/// Combine the DB30 and DB41 device tables.
pub fn status_snapshot(
    blocks: impl IntoIterator<Item = Vec<DeviceStatus>>,
    plc_connected: bool,
    now: DateTime<Utc>,
) -> StatusSnapshot {
    StatusSnapshot {
        devices: blocks.into_iter().flatten().collect(),
        plc_connected,
        timestamp: now,
    }
}
