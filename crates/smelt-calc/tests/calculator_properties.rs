//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Randomised invariants of the derived-value calculators."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{Duration, TimeZone, Utc};
use rand::prelude::*;
use smelt_calc::{
    arc_power_kw, Calculators, CoolingCalculator, EnergyCalculator, ValveOpennessCalculator,
    GAP_THRESHOLD_SECS,
};
use smelt_common::{PhaseValues, ValveSettings};

const CASES: usize = 64;

#[test]
fn energy_is_monotonic_riemann_sum() {
    let mut rng = StdRng::seed_from_u64(0xE4E7);
    for _ in 0..CASES {
        let mut calc = EnergyCalculator::new();
        let mut now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut expected = 0.0;
        let mut previous = 0.0;
        let mut armed = false;
        for _ in 0..rng.gen_range(1..40) {
            let current = PhaseValues::new(
                rng.gen_range(0.0..8000.0),
                rng.gen_range(0.0..8000.0),
                rng.gen_range(0.0..8000.0),
            );
            let voltage = PhaseValues::new(
                rng.gen_range(60.0..140.0),
                rng.gen_range(60.0..140.0),
                rng.gen_range(60.0..140.0),
            );
            let dt_ms = rng.gen_range(1..=(GAP_THRESHOLD_SECS as i64 * 1000));
            now += Duration::milliseconds(dt_ms);
            let reading = calc.update(&current, &voltage, now);
            if armed {
                expected += arc_power_kw(&current, &voltage) * (dt_ms as f64 / 1000.0) / 3600.0;
            }
            armed = true;
            assert!(reading.power_total >= 0.0);
            assert!(reading.energy_total >= previous);
            previous = reading.energy_total;
        }
        assert!((calc.energy_total() - expected).abs() < 1e-6 * expected.max(1.0));
    }
}

#[test]
fn gaps_never_change_totals() {
    let mut rng = StdRng::seed_from_u64(0x6A95);
    let current = PhaseValues::new(4000.0, 4000.0, 4000.0);
    let voltage = PhaseValues::new(100.0, 100.0, 100.0);
    for _ in 0..CASES {
        let t0 = Utc::now();
        let gap = Duration::seconds(rng.gen_range(31..100_000));

        let mut energy = EnergyCalculator::new();
        energy.update(&current, &voltage, t0);
        let before = energy.energy_total();
        energy.update(&current, &voltage, t0 + gap);
        assert_eq!(energy.energy_total(), before);

        let mut cooling = CoolingCalculator::new();
        cooling.update(50.0, 50.0, t0);
        let totals = cooling.update(50.0, 50.0, t0 + gap);
        assert_eq!(totals.shell_total, 0.0);
        assert_eq!(totals.cover_total, 0.0);
    }
}

#[test]
fn valve_openness_is_clamped_and_order_preserving() {
    let mut rng = StdRng::seed_from_u64(0x7A1E);
    for _ in 0..CASES {
        let samples: Vec<(usize, u8, f64)> = (0..rng.gen_range(0..200))
            .map(|_| {
                (
                    rng.gen_range(1..=4),
                    rng.gen_range(0..4u8),
                    rng.gen_range(-5.0..45.0),
                )
            })
            .collect();

        let mut one_by_one = ValveOpennessCalculator::default();
        for &(valve_id, pair, dt) in &samples {
            one_by_one.add_valve_status(valve_id, pair, dt);
            for valve in one_by_one.openness().0 {
                assert!((0.0..=100.0).contains(&valve));
            }
        }
        let mut batched = ValveOpennessCalculator::default();
        batched.batch_add_valve_statuses(&samples);

        assert_eq!(
            one_by_one.flush_valve_openness_buffers(),
            batched.flush_valve_openness_buffers()
        );
    }
}

#[test]
fn batch_reset_keeps_energy_and_valves() {
    let calculators = Calculators::new(ValveSettings::default());
    let t0 = Utc::now();
    let current = PhaseValues::new(1000.0, 1000.0, 1000.0);
    let voltage = PhaseValues::new(100.0, 100.0, 100.0);
    {
        let mut energy = calculators.energy.lock();
        energy.update(&current, &voltage, t0);
        energy.update(&current, &voltage, t0 + Duration::seconds(10));
    }
    {
        let mut cooling = calculators.cooling.lock();
        cooling.update(36.0, 36.0, t0);
        cooling.update(36.0, 36.0, t0 + Duration::seconds(10));
    }
    calculators
        .valves
        .lock()
        .batch_add_valve_statuses(&[(1, 0b10, 15.0)]);
    calculators.valves.lock().flush_valve_openness_buffers();
    calculators.feeding.lock().update(100.0, true, t0);

    let energy_before = calculators.energy.lock().energy_total();
    calculators.reset_batch_totals();

    assert_eq!(calculators.energy.lock().energy_total(), energy_before);
    assert_eq!(calculators.valves.lock().openness().get(1), Some(50.0));
    assert_eq!(calculators.cooling.lock().totals().shell_total, 0.0);
    assert_eq!(calculators.feeding.lock().feeding_total(), 0.0);
}
