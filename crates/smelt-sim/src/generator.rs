//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Synthetic furnace process data for mock mode."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::f64::consts::PI;

use rand::prelude::*;
use rand_distr::StandardNormal;
use smelt_common::DeviceStatus;
use smelt_plc::decode::pack_valve_byte;
use smelt_plc::register_map::devices;
use smelt_plc::{ArcRaw, HopperRaw, SensorRaw};

/// Length of one hopper fill/discharge cycle in seconds.
pub const HOPPER_CYCLE_S: f64 = 60.0;
/// Part of the hopper cycle during which the scale reports a discharge.
const DISCHARGE_WINDOW: (f64, f64) = (40.0, 43.0);
/// Valve motor pattern period in seconds.
pub const VALVE_CYCLE_S: f64 = 80.0;

/// Deterministic synthetic furnace driven by an elapsed-time axis.
///
/// Waveforms are smooth functions of `t`; Gaussian noise comes from a seeded
/// RNG so runs with the same seed and sample times are reproducible.
#[derive(Debug)]
pub struct FurnaceGenerator {
    rng: StdRng,
    feeding_counter: f64,
    discharge_cycle: Option<u64>,
    discharge_weight: f64,
}

impl FurnaceGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            feeding_counter: 0.0,
            discharge_cycle: None,
            discharge_weight: 0.0,
        }
    }

    fn noise(&mut self, sigma: f64) -> f64 {
        let sample: f64 = self.rng.sample(StandardNormal);
        sample * sigma
    }

    pub fn arc(&mut self, t: f64) -> ArcRaw {
        let mut raw = ArcRaw {
            setpoint: [5200; 3],
            deadzone_percent: 5.0,
            emergency_enabled: true,
            arc_limit: 8000,
            emergency_delay_ms: 500,
            ..ArcRaw::default()
        };
        for phase in 0..3 {
            let shift = phase as f64 * 2.0 * PI / 3.0;
            let current = 5000.0 + 300.0 * (2.0 * PI * 0.02 * t + shift).sin() + self.noise(25.0);
            let voltage = 90.0 + 3.0 * (2.0 * PI * 0.01 * t + shift).cos() + self.noise(0.4);
            raw.current[phase] = current.round().clamp(0.0, f64::from(i16::MAX)) as i16;
            raw.voltage[phase] = voltage.max(0.0) as f32;
        }
        raw
    }

    pub fn sensor(&mut self, t: f64) -> SensorRaw {
        let mut raw = SensorRaw {
            fan_running: true,
            ..SensorRaw::default()
        };
        for electrode in 0..3 {
            let depth = 1200.0
                + 40.0 * (2.0 * PI * 0.005 * t + electrode as f64).sin()
                + self.noise(1.5);
            raw.electrode_depth_mm[electrode] = depth as f32;
        }
        raw.water_pressure = [
            (0.35 + 0.01 * (2.0 * PI * 0.03 * t).sin() + self.noise(0.002)) as f32,
            (0.27 + 0.01 * (2.0 * PI * 0.03 * t).cos() + self.noise(0.002)) as f32,
        ];
        raw.water_flow = [
            (12.5 + 0.6 * (2.0 * PI * 0.02 * t).sin() + self.noise(0.05)).max(0.0) as f32,
            (9.8 + 0.4 * (2.0 * PI * 0.02 * t).cos() + self.noise(0.05)).max(0.0) as f32,
        ];
        raw.hopper_weight = hopper_weight(t) as f32;
        raw.valve_byte = valve_byte(t);
        raw
    }

    /// DB19 content. The feeding counter advances once per discharge.
    pub fn hopper(&mut self, t: f64) -> HopperRaw {
        let cycle = (t.max(0.0) / HOPPER_CYCLE_S) as u64;
        let phase = t.max(0.0) % HOPPER_CYCLE_S;
        let discharging = (DISCHARGE_WINDOW.0..DISCHARGE_WINDOW.1).contains(&phase);
        if discharging && self.discharge_cycle != Some(cycle) {
            self.discharge_cycle = Some(cycle);
            self.discharge_weight = (120.0 + self.noise(15.0)).clamp(60.0, 180.0).round();
            self.feeding_counter += self.discharge_weight;
        }
        HopperRaw {
            feeding_counter: self.feeding_counter as f32,
            discharge_weight: if discharging {
                self.discharge_weight as f32
            } else {
                0.0
            },
            state: hopper_state(phase),
        }
    }

    /// Device table for DB30 or DB41: every device healthy, status counts time.
    pub fn devices(&mut self, db: u16, t: f64) -> Vec<DeviceStatus> {
        let names = devices::names(db).unwrap_or(&[]);
        names
            .iter()
            .enumerate()
            .map(|(index, name)| DeviceStatus {
                block: db,
                device_name: (*name).to_owned(),
                done: true,
                busy: (t as u64 + index as u64) % 10 == 0,
                error: false,
                status: 0,
            })
            .collect()
    }
}

/// Hopper scale: fills for 30 s, waits, then empties through the discharge.
pub fn hopper_weight(t: f64) -> f64 {
    let phase = t.max(0.0) % HOPPER_CYCLE_S;
    if phase < 30.0 {
        3800.0 * phase / 30.0
    } else if phase < DISCHARGE_WINDOW.1 {
        3800.0
    } else {
        3800.0 * (1.0 - (phase - DISCHARGE_WINDOW.1) / (HOPPER_CYCLE_S - DISCHARGE_WINDOW.1))
    }
}

fn hopper_state(phase: f64) -> u8 {
    if phase < 30.0 {
        1
    } else if phase < DISCHARGE_WINDOW.0 {
        2
    } else if phase < DISCHARGE_WINDOW.1 {
        3
    } else {
        0
    }
}

/// Valve `i` opens for 20 s, holds, closes for 20 s, holds; valves are staggered by 10 s.
pub fn valve_byte(t: f64) -> u8 {
    let mut flags = [(false, false); 4];
    for (index, flag) in flags.iter_mut().enumerate() {
        let phase = (t.max(0.0) + 10.0 * index as f64) % VALVE_CYCLE_S;
        *flag = if phase < 20.0 {
            (false, true)
        } else if (40.0..60.0).contains(&phase) {
            (true, false)
        } else {
            (false, false)
        };
    }
    pack_valve_byte(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_plc::valve_bits;

    #[test]
    fn same_seed_same_samples() {
        let mut a = FurnaceGenerator::new(7);
        let mut b = FurnaceGenerator::new(7);
        for step in 0..20 {
            let t = f64::from(step) * 0.5;
            assert_eq!(a.arc(t), b.arc(t));
            assert_eq!(a.sensor(t), b.sensor(t));
        }
    }

    #[test]
    fn arc_values_stay_in_operating_band() {
        let mut generator = FurnaceGenerator::new(1);
        for step in 0..200 {
            let raw = generator.arc(f64::from(step));
            assert!(raw.current.iter().all(|a| (4400..=5600).contains(a)));
            assert!(raw.voltage.iter().all(|v| (80.0..100.0).contains(v)));
        }
    }

    #[test]
    fn discharge_is_reported_once_per_cycle_window() {
        let mut generator = FurnaceGenerator::new(3);
        let mut counter_steps = Vec::new();
        for step in 0..240 {
            let raw = generator.hopper(f64::from(step) * 0.5);
            counter_steps.push(raw.feeding_counter);
            if raw.discharge_weight > 0.0 {
                assert_eq!(raw.state, 3);
            }
        }
        let mut distinct = counter_steps.clone();
        distinct.dedup();
        // two full cycles in 120 s, plus the initial zero
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn valve_pattern_opens_then_closes() {
        assert_eq!(valve_bits(valve_byte(5.0), 1).unwrap().open_bit, 1);
        assert_eq!(valve_bits(valve_byte(45.0), 1).unwrap().close_bit, 1);
        assert_eq!(valve_bits(valve_byte(25.0), 1).unwrap().pair, 0);
        // valve 2 runs ten seconds ahead
        assert_eq!(valve_bits(valve_byte(35.0), 2).unwrap().close_bit, 1);
    }
}
