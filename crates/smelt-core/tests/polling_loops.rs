//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Polling loop behaviour against an in-memory PLC image."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smelt_cache::DataCache;
use smelt_calc::Calculators;
use smelt_common::{BatchStatus, DeviceStatus, PollingSettings, PollingSpeed};
use smelt_core::{BridgeEvent, DataBridge, LoopDeps, LoopState, PollingConfig, PollingLoops};
use smelt_history::{HistoryMetrics, HistoryWriter, MemoryStore};
use smelt_metrics::PollingMetrics;
use smelt_plc::decode::{
    encode_arc_block, encode_device_block, encode_hopper_block, encode_sensor_block, BlockWriter,
};
use smelt_plc::register_map::{
    db18, devices, DB_ARC, DB_DEVICE_COMM, DB_DEVICE_STATUS, DB_HOPPER, DB_HOPPER_LIMIT,
    DB_SENSOR,
};
use smelt_plc::{ArcRaw, HopperRaw, MemoryTransport, PlcConnection, SensorRaw};
use tokio::sync::broadcast::error::RecvError;

struct Rig {
    image: MemoryTransport,
    connection: Arc<PlcConnection>,
    cache: Arc<DataCache>,
    calculators: Arc<Calculators>,
    store: MemoryStore,
    history: Arc<HistoryWriter>,
    bridge: DataBridge,
    metrics: PollingMetrics,
    speed: PollingConfig,
    loops: PollingLoops,
}

fn upper_limit_block(kg: i32) -> Vec<u8> {
    let mut block = BlockWriter::new(db18::UPPER_LIMIT + db18::SIZE);
    block.put_i32(db18::UPPER_LIMIT, kg);
    block.into_bytes()
}

fn device_table(db: u16) -> Vec<u8> {
    let entries: Vec<DeviceStatus> = devices::names(db)
        .unwrap_or_default()
        .iter()
        .map(|name| DeviceStatus {
            block: db,
            device_name: (*name).to_owned(),
            done: true,
            busy: false,
            error: false,
            status: 0,
        })
        .collect();
    encode_device_block(db, &entries)
}

fn seeded_image() -> MemoryTransport {
    let image = MemoryTransport::default();
    image.set_block(
        DB_ARC,
        encode_arc_block(&ArcRaw {
            current: [5000; 3],
            voltage: [90.0; 3],
            setpoint: [5200; 3],
            deadzone_percent: 5.0,
            emergency_enabled: true,
            arc_limit: 8000,
            emergency_delay_ms: 500,
            ..ArcRaw::default()
        }),
    );
    image.set_block(
        DB_SENSOR,
        encode_sensor_block(&SensorRaw {
            electrode_depth_mm: [1200.0, 1180.0, 1210.0],
            water_pressure: [0.35, 0.27],
            water_flow: [12.5, 9.8],
            hopper_weight: 2100.0,
            valve_byte: 0,
            fan_running: true,
        }),
    );
    image.set_block(DB_HOPPER, encode_hopper_block(&HopperRaw::default()));
    image.set_block(DB_HOPPER_LIMIT, upper_limit_block(5200));
    image.set_block(DB_DEVICE_COMM, device_table(DB_DEVICE_COMM));
    image.set_block(DB_DEVICE_STATUS, device_table(DB_DEVICE_STATUS));
    image
}

fn fast_settings() -> PollingSettings {
    PollingSettings {
        idle_interval: Duration::from_millis(20),
        db32_interval: Duration::from_millis(20),
        status_interval: Duration::from_millis(20),
        upper_limit_refresh: Duration::from_millis(50),
        join_timeout: Duration::from_millis(300),
        reconnect_backoff_initial: Duration::from_millis(10),
        reconnect_backoff_max: Duration::from_millis(40),
        ..PollingSettings::default()
    }
}

fn rig_with(image: MemoryTransport, settings: PollingSettings, io_timeout: Duration) -> Rig {
    let connection = Arc::new(PlcConnection::new(Box::new(image.clone()), io_timeout));
    let cache = Arc::new(DataCache::default());
    let calculators = Arc::new(Calculators::default());
    let store = MemoryStore::new();
    let history = Arc::new(HistoryWriter::spawn(
        Arc::new(store.clone()),
        "sensor_data",
        64,
        HistoryMetrics::unregistered().unwrap(),
    ));
    let bridge = DataBridge::default();
    let metrics = PollingMetrics::unregistered().unwrap();
    let speed = PollingConfig::new(PollingSpeed::Fast);
    let loops = PollingLoops::new(
        LoopDeps {
            connection: Arc::clone(&connection),
            cache: Arc::clone(&cache),
            calculators: Arc::clone(&calculators),
            history: Arc::clone(&history),
            bridge: bridge.clone(),
            metrics: metrics.clone(),
        },
        settings,
        speed.clone(),
    );
    Rig {
        image,
        connection,
        cache,
        calculators,
        store,
        history,
        bridge,
        metrics,
        speed,
        loops,
    }
}

fn rig() -> Rig {
    rig_with(seeded_image(), fast_settings(), Duration::from_millis(200))
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loops_fill_the_cache_and_report_liveness() {
    let rig = rig();
    assert!(!rig.loops.get_polling_loops_status().db1_running);
    assert!(rig.loops.start_all_polling_loops());
    assert!(!rig.loops.start_all_polling_loops());

    wait_until("all three snapshots", || {
        let stats = rig.cache.get_stats();
        stats.has_arc && stats.has_sensor && stats.has_status
    })
    .await;

    let arc = rig.cache.get_arc_data().unwrap();
    assert_eq!(arc.arc_current.u, 5000.0);
    assert_eq!(arc.emergency_stop.arc_limit, 8000);
    let sensor = rig.cache.get_sensor_data().unwrap();
    assert_eq!(sensor.hopper.weight, 2100.0);
    assert_eq!(rig.cache.get_hopper_upper_limit(), 5200);
    let status = rig.cache.get_status_data().unwrap();
    assert_eq!(status.devices.len(), 8);
    assert!(status.plc_connected);

    let health = rig.loops.get_polling_loops_status();
    assert!(health.db1_running && health.db32_running && health.status_running);
    assert_eq!(health.db32_state, LoopState::Running);
    assert!(health.plc_connected);
    assert!(rig.metrics.cycles("db1") > 0);

    let started = Instant::now();
    rig.loops.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    let health = rig.loops.get_polling_loops_status();
    assert!(!health.db1_running && !health.db32_running && !health.status_running);
    assert_eq!(health.status_state, LoopState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn history_is_written_only_while_a_batch_runs() {
    let rig = rig();
    rig.loops.start_all_polling_loops();
    wait_until("a few arc cycles", || rig.cache.get_stats().arc_updates >= 3).await;
    rig.history.flush().await.unwrap();
    assert!(rig.store.is_empty());

    rig.cache.set_batch_status(BatchStatus {
        is_smelting: true,
        batch_code: Some("B-42".into()),
        start_time: Some(chrono::Utc::now()),
        elapsed_seconds: 0.0,
    });
    let before = rig.cache.get_stats().arc_updates;
    wait_until("cycles inside the batch", || {
        rig.cache.get_stats().arc_updates >= before + 3
    })
    .await;
    rig.history.flush().await.unwrap();
    assert!(!rig.store.is_empty());

    rig.loops.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn switching_db1_speed_keeps_calculator_state() {
    let rig = rig();
    rig.loops.start_all_polling_loops();
    wait_until("energy to accumulate", || {
        rig.calculators.energy.lock().energy_total() > 0.0
    })
    .await;
    assert_eq!(rig.loops.get_polling_loops_status().db1_interval_ms, 20);

    let energy_before = rig.calculators.energy.lock().energy_total();
    let feeding_before = rig.calculators.feeding.lock().feeding_total();
    let openness_before = rig.calculators.valves.lock().openness();

    rig.loops.switch_db1_speed(true);
    rig.speed.set_polling_speed(PollingSpeed::Normal);
    wait_until("the new cadence", || {
        rig.loops.get_polling_loops_status().db1_interval_ms == 500
    })
    .await;
    let updates = rig.cache.get_stats().arc_updates;
    wait_until("an arc cycle at the new cadence", || {
        rig.cache.get_stats().arc_updates > updates
    })
    .await;

    let status = rig.loops.get_polling_loops_status();
    assert!(status.db1_running);
    assert!(status.high_speed);
    assert_eq!(status.speed, PollingSpeed::Normal);
    assert!(rig.calculators.energy.lock().energy_total() >= energy_before);
    assert_eq!(
        rig.calculators.feeding.lock().feeding_total().to_bits(),
        feeding_before.to_bits()
    );
    assert_eq!(rig.calculators.valves.lock().openness(), openness_before);

    rig.loops.switch_db1_speed(false);
    wait_until("the idle cadence", || {
        rig.loops.get_polling_loops_status().db1_interval_ms == 20
    })
    .await;
    rig.loops.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hopper_upper_limit_falls_back_to_default() {
    let image = seeded_image();
    image.set_block(DB_HOPPER_LIMIT, upper_limit_block(0));
    let rig = rig_with(image, fast_settings(), Duration::from_millis(200));
    rig.loops.start_all_polling_loops();

    wait_until("a sensor cycle", || rig.cache.get_stats().has_sensor).await;
    assert_eq!(rig.cache.get_hopper_upper_limit(), 4900);
    assert_eq!(rig.calculators.feeding.lock().hopper_upper_limit(), 4900);

    rig.image.set_block(DB_HOPPER_LIMIT, upper_limit_block(6100));
    wait_until("the refreshed limit", || {
        rig.cache.get_hopper_upper_limit() == 6100
    })
    .await;
    wait_until("the limit in the sensor snapshot", || {
        rig.cache
            .get_sensor_data()
            .is_some_and(|sensor| sensor.hopper.upper_limit == 6100)
    })
    .await;

    // too short for offset 40, so the read itself fails
    rig.image.set_block(DB_HOPPER_LIMIT, vec![0; 8]);
    wait_until("the fallback after a failed read", || {
        rig.cache.get_hopper_upper_limit() == 4900
    })
    .await;
    assert!(rig.loops.get_polling_loops_status().db32_running);
    rig.loops.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_cycles_keep_the_last_good_snapshot() {
    let rig = rig();
    rig.loops.start_all_polling_loops();
    wait_until("an arc snapshot", || rig.cache.get_stats().has_arc).await;

    rig.image.set_block(DB_ARC, vec![0; 10]);
    wait_until("a skipped arc cycle", || {
        rig.metrics.failures("db1", "access_denied") > 0
    })
    .await;
    let stale = rig.cache.get_arc_data().unwrap();
    let updates = rig.cache.get_stats().arc_updates;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.cache.get_stats().arc_updates, updates);
    assert_eq!(rig.cache.get_arc_data().unwrap(), stale);
    assert_eq!(stale.arc_current.u, 5000.0);
    // the other loops are unaffected
    let sensor_updates = rig.cache.get_stats().sensor_updates;
    wait_until("sensor cycles", || {
        rig.cache.get_stats().sensor_updates > sensor_updates
    })
    .await;
    assert!(rig.connection.is_connected());
    rig.loops.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn link_loss_is_survived_and_reported() {
    let rig = rig();
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let mut events = rig.bridge.subscribe();
    let collector = {
        let transitions = Arc::clone(&transitions);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BridgeEvent::Connection(up)) => transitions.lock().push(up),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };
    rig.loops.start_all_polling_loops();
    wait_until("device status", || rig.cache.get_stats().has_status).await;

    rig.image.set_offline(true);
    wait_until("the link to drop", || !rig.connection.is_connected()).await;
    wait_until("the cached status flag", || {
        rig.cache
            .get_status_data()
            .is_some_and(|status| !status.plc_connected)
    })
    .await;
    let status = rig.loops.get_polling_loops_status();
    assert!(status.db1_running && status.db32_running && status.status_running);
    assert!(rig.cache.get_arc_data().is_some());

    rig.image.set_offline(false);
    wait_until("the link to come back", || rig.connection.is_connected()).await;
    let updates = rig.cache.get_stats().arc_updates;
    wait_until("fresh arc cycles", || {
        rig.cache.get_stats().arc_updates > updates
    })
    .await;
    rig.loops.shutdown().await;
    collector.abort();

    let transitions = transitions.lock().clone();
    assert!(transitions.windows(2).any(|pair| pair == [false, true]));
    let reconnect_failures: u64 = ["db1", "db32", "status"]
        .iter()
        .map(|name| rig.metrics.failures(name, "connect"))
        .sum();
    assert!(reconnect_failures > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_drop_after_a_preconnected_start_is_reported() {
    let rig = rig();
    assert!(rig.connection.connect().await);
    let mut events = rig.bridge.subscribe();
    let dropped = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BridgeEvent::Connection(false)) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
    });

    rig.loops.start_all_polling_loops();
    assert!(rig.metrics.plc_connected());
    wait_until("device status", || {
        rig.cache
            .get_status_data()
            .is_some_and(|status| status.plc_connected)
    })
    .await;

    rig.image.set_offline(true);
    let reported = tokio::time::timeout(Duration::from_secs(5), dropped)
        .await
        .expect("no link-down event")
        .unwrap();
    assert!(reported);
    wait_until("the cached status flag", || {
        rig.cache
            .get_status_data()
            .is_some_and(|status| !status.plc_connected)
    })
    .await;
    assert!(!rig.metrics.plc_connected());
    rig.loops.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_bounded_when_a_read_hangs() {
    let image = seeded_image();
    let rig = rig_with(image, fast_settings(), Duration::from_secs(10));
    rig.loops.start_all_polling_loops();
    wait_until("an arc snapshot", || rig.cache.get_stats().has_arc).await;

    rig.image.set_latency(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    rig.loops.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    let status = rig.loops.get_polling_loops_status();
    assert!(!status.db1_running && !status.db32_running && !status.status_running);
}
