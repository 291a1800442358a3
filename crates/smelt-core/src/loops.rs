//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Arc, sensor and device-status polling loops."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The three acquisition loops.
//!
//! Each loop is its own task with its own cadence, so a stalled read in one
//! never delays the ticks of the others. A cycle reads its blocks, decodes
//! them, advances the calculators, refreshes the cache, forwards the snapshot
//! to history while a batch runs and publishes it on the bridge. Any failure
//! skips the rest of the cycle and leaves the cached values untouched.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use smelt_cache::DataCache;
use smelt_calc::Calculators;
use smelt_common::{PollingSettings, PollingSpeed};
use smelt_history::HistoryWriter;
use smelt_metrics::PollingMetrics;
use smelt_plc::register_map::{
    db1, db18, db19, db32, devices, DB_ARC, DB_DEVICE_COMM, DB_DEVICE_STATUS, DB_HOPPER,
    DB_HOPPER_LIMIT, DB_SENSOR,
};
use smelt_plc::{
    decode_arc_block, decode_device_block, decode_hopper_block, decode_sensor_block,
    decode_upper_limit, HopperRaw, PlcConnection, PlcError,
};
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{BridgeEvent, DataBridge};
use crate::polling_config::PollingConfig;
use crate::processor;
use crate::scheduling::{Backoff, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoopName {
    /// DB1 arc data.
    Db1,
    /// DB32 sensors plus the DB19 hopper and DB18 upper limit.
    Db32,
    /// DB30/DB41 device tables.
    Status,
}

impl LoopName {
    fn index(self) -> usize {
        match self {
            LoopName::Db1 => 0,
            LoopName::Db32 => 1,
            LoopName::Status => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum LoopState {
    #[default]
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Reconnecting = 3,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LoopState::Starting,
            2 => LoopState::Running,
            3 => LoopState::Reconnecting,
            _ => LoopState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct LoopStates([AtomicU8; 3]);

impl LoopStates {
    fn set(&self, name: LoopName, state: LoopState) {
        let previous = self.0[name.index()].swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(loop_name = %name, %state, "polling loop state");
        }
    }

    fn get(&self, name: LoopName) -> LoopState {
        LoopState::from_u8(self.0[name.index()].load(Ordering::Acquire))
    }
}

/// Health of the acquisition loops for the status display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollingLoopsStatus {
    pub db1_running: bool,
    pub db32_running: bool,
    pub status_running: bool,
    pub db1_state: LoopState,
    pub db32_state: LoopState,
    pub status_state: LoopState,
    pub high_speed: bool,
    pub speed: PollingSpeed,
    pub db1_interval_ms: u64,
    pub plc_connected: bool,
}

/// Collaborators shared by all loops.
#[derive(Debug, Clone)]
pub struct LoopDeps {
    pub connection: Arc<PlcConnection>,
    pub cache: Arc<DataCache>,
    pub calculators: Arc<Calculators>,
    pub history: Arc<HistoryWriter>,
    pub bridge: DataBridge,
    pub metrics: PollingMetrics,
}

#[derive(Debug)]
struct Shared {
    deps: LoopDeps,
    settings: PollingSettings,
    states: LoopStates,
    link_up: AtomicBool,
}

#[derive(Debug)]
struct Running {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(LoopName, JoinHandle<()>)>,
}

/// Owner of the three polling tasks.
#[derive(Debug)]
pub struct PollingLoops {
    shared: Arc<Shared>,
    speed: PollingConfig,
    high_speed: watch::Sender<bool>,
    running: Mutex<Option<Running>>,
}

impl PollingLoops {
    pub fn new(deps: LoopDeps, settings: PollingSettings, speed: PollingConfig) -> Self {
        let (high_speed, _rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                deps,
                settings,
                states: LoopStates::default(),
                link_up: AtomicBool::new(false),
            }),
            speed,
            high_speed,
            running: Mutex::new(None),
        }
    }

    pub fn speed_config(&self) -> &PollingConfig {
        &self.speed
    }

    /// Spawn the DB1, DB32 and status loops. Returns false if they are
    /// already running.
    pub fn start_all_polling_loops(&self) -> bool {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if current.tasks.iter().any(|(_, task)| !task.is_finished()) {
                warn!("polling loops already running");
                return false;
            }
        }

        // transitions are measured from the link state at start
        let connected = self.shared.deps.connection.is_connected();
        self.shared.link_up.store(connected, Ordering::Release);
        self.shared.deps.metrics.set_plc_connected(connected);

        let (shutdown, _rx) = broadcast::channel(4);
        let tasks = LoopName::iter()
            .map(|name| {
                self.shared.states.set(name, LoopState::Starting);
                let task = tokio::spawn(run_loop(
                    name,
                    Arc::clone(&self.shared),
                    self.cadence(name),
                    shutdown.subscribe(),
                ));
                (name, task)
            })
            .collect();
        *running = Some(Running { shutdown, tasks });
        info!(
            transport = ?self.shared.deps.connection.kind(),
            "polling loops started"
        );
        true
    }

    /// Toggle the DB1 loop between the smelting cadence (the configured
    /// polling speed) and the idle interval. The loop keeps running and the
    /// calculators keep their state.
    pub fn switch_db1_speed(&self, high_speed: bool) {
        let changed = self.high_speed.send_if_modified(|current| {
            let changed = *current != high_speed;
            *current = high_speed;
            changed
        });
        if changed {
            info!(
                high_speed,
                interval_ms = self.db1_interval().as_millis() as u64,
                "DB1 polling speed switched"
            );
        }
    }

    pub fn get_polling_loops_status(&self) -> PollingLoopsStatus {
        let alive = |name: LoopName| {
            self.running.lock().as_ref().is_some_and(|running| {
                running
                    .tasks
                    .iter()
                    .any(|(task_name, task)| *task_name == name && !task.is_finished())
            })
        };
        let state = |name: LoopName| {
            if alive(name) {
                self.shared.states.get(name)
            } else {
                LoopState::Stopped
            }
        };
        PollingLoopsStatus {
            db1_running: alive(LoopName::Db1),
            db32_running: alive(LoopName::Db32),
            status_running: alive(LoopName::Status),
            db1_state: state(LoopName::Db1),
            db32_state: state(LoopName::Db32),
            status_state: state(LoopName::Status),
            high_speed: *self.high_speed.borrow(),
            speed: self.speed.get_polling_speed(),
            db1_interval_ms: self.db1_interval().as_millis() as u64,
            plc_connected: self.shared.deps.connection.is_connected(),
        }
    }

    /// Signal every loop to stop at its next tick boundary and wait for them,
    /// aborting whatever is still busy once the join timeout has passed.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        let Some(Running { shutdown, tasks }) = running else {
            return;
        };
        let _ = shutdown.send(());
        let deadline = Instant::now() + self.shared.settings.join_timeout;
        for (name, mut task) in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!(loop_name = %name, "polling loop joined"),
                Ok(Err(err)) => {
                    error!(loop_name = %name, error = %err, "polling loop task join error")
                }
                Err(_) => {
                    warn!(loop_name = %name, "polling loop did not stop in time, aborting");
                    task.abort();
                }
            }
            self.shared.states.set(name, LoopState::Stopped);
            self.shared.deps.metrics.set_running(name.as_ref(), false);
        }
        info!("polling loops stopped");
    }

    fn db1_interval(&self) -> Duration {
        arc_interval(
            *self.high_speed.borrow(),
            self.speed.get_polling_speed(),
            self.shared.settings.idle_interval,
        )
    }

    fn cadence(&self, name: LoopName) -> Cadence {
        match name {
            LoopName::Db1 => Cadence::Arc {
                speed: self.speed.subscribe(),
                high_speed: self.high_speed.subscribe(),
                idle: self.shared.settings.idle_interval,
            },
            LoopName::Db32 => Cadence::Fixed(self.shared.settings.db32_interval),
            LoopName::Status => Cadence::Fixed(self.shared.settings.status_interval),
        }
    }
}

fn arc_interval(high_speed: bool, speed: PollingSpeed, idle: Duration) -> Duration {
    if high_speed {
        speed.interval()
    } else {
        idle
    }
}

/// Where a loop takes its tick period from.
enum Cadence {
    Fixed(Duration),
    Arc {
        speed: watch::Receiver<PollingSpeed>,
        high_speed: watch::Receiver<bool>,
        idle: Duration,
    },
}

impl Cadence {
    fn period(&self) -> Duration {
        match self {
            Cadence::Fixed(period) => *period,
            Cadence::Arc {
                speed,
                high_speed,
                idle,
            } => arc_interval(*high_speed.borrow(), *speed.borrow(), *idle),
        }
    }

    /// Resolve with the new period whenever an input changes. Never resolves
    /// for a fixed cadence.
    async fn changed(&mut self) -> Duration {
        let alive = match self {
            Cadence::Fixed(_) => false,
            Cadence::Arc {
                speed, high_speed, ..
            } => tokio::select! {
                result = speed.changed() => result.is_ok(),
                result = high_speed.changed() => result.is_ok(),
            },
        };
        if !alive {
            std::future::pending::<()>().await;
        }
        self.period()
    }
}

async fn run_loop(
    name: LoopName,
    shared: Arc<Shared>,
    mut cadence: Cadence,
    mut shutdown: broadcast::Receiver<()>,
) {
    let settings = &shared.settings;
    let mut limiter = RateLimiter::new(cadence.period());
    let mut backoff = Backoff::new(
        settings.reconnect_backoff_initial,
        settings.reconnect_backoff_max,
    );
    let mut worker = Worker::new(name);
    shared.deps.metrics.set_running(name.as_ref(), true);
    info!(
        loop_name = %name,
        interval_ms = limiter.period().as_millis() as u64,
        "polling loop started"
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!(loop_name = %name, "polling loop shutdown signal received");
                break;
            }
            period = cadence.changed() => {
                limiter.set_period(period);
                info!(
                    loop_name = %name,
                    interval_ms = period.as_millis() as u64,
                    "polling interval changed"
                );
            }
            _ = limiter.tick() => {
                if !shared.ensure_connected(name, &mut backoff).await {
                    continue;
                }
                shared.states.set(name, LoopState::Running);
                let started = std::time::Instant::now();
                match worker.cycle(&shared).await {
                    Ok(()) => shared
                        .deps
                        .metrics
                        .record_cycle(name.as_ref(), started.elapsed().as_secs_f64()),
                    Err(err) => {
                        shared.deps.metrics.record_failure(name.as_ref(), failure_reason(&err));
                        warn!(loop_name = %name, error = %err, "polling cycle skipped");
                        if !shared.deps.connection.is_connected() {
                            shared.note_link(false);
                        }
                    }
                }
            }
        }
    }

    shared.states.set(name, LoopState::Stopped);
    shared.deps.metrics.set_running(name.as_ref(), false);
    info!(loop_name = %name, "polling loop stopped");
}

fn failure_reason(err: &PlcError) -> &'static str {
    match err {
        PlcError::Decode(_) => "decode",
        PlcError::Timeout { .. } => "timeout",
        PlcError::Disconnected => "disconnected",
        PlcError::AccessDenied { .. } => "access_denied",
        PlcError::Protocol(_) => "protocol",
        PlcError::Io(_) | PlcError::Config(_) => "io",
    }
}

impl Shared {
    /// True when the link is up, reconnecting first if the backoff allows.
    async fn ensure_connected(&self, name: LoopName, backoff: &mut Backoff) -> bool {
        let connection = &self.deps.connection;
        if connection.is_connected() {
            if backoff.attempts() > 0 {
                backoff.reset();
            }
            return true;
        }
        self.states.set(name, LoopState::Reconnecting);
        self.note_link(false);
        let now = Instant::now();
        if !backoff.ready(now) {
            return false;
        }
        if connection.connect().await {
            backoff.reset();
            self.note_link(true);
            true
        } else {
            let retry_in = backoff.failed(now);
            self.deps.metrics.record_failure(name.as_ref(), "connect");
            warn!(
                loop_name = %name,
                attempt = backoff.attempts(),
                retry_in_ms = retry_in.as_millis() as u64,
                "PLC reconnect failed"
            );
            false
        }
    }

    /// Publish link transitions and flag the cached device table when it drops.
    fn note_link(&self, up: bool) {
        self.deps.metrics.set_plc_connected(up);
        if self.link_up.swap(up, Ordering::AcqRel) == up {
            return;
        }
        if up {
            info!("PLC link up");
        } else {
            warn!("PLC link down, serving cached values");
            if let Some(mut status) = self.deps.cache.get_status_data() {
                status.plc_connected = false;
                self.deps.cache.set_status_data(status);
            }
        }
        self.deps.bridge.publish(BridgeEvent::Connection(up));
    }

    async fn arc_cycle(&self) -> smelt_plc::Result<()> {
        let deps = &self.deps;
        let bytes = deps.connection.read_db(DB_ARC, 0, db1::SIZE).await?;
        let raw = decode_arc_block(&bytes)?;
        let snapshot = processor::arc_snapshot(&raw, &deps.calculators, Utc::now());
        deps.cache.set_arc_data(snapshot.clone());
        let batch = deps.cache.get_batch_status();
        if let Some(code) = batch.active_code() {
            deps.history.write_arc(&snapshot, code);
        }
        trace!(
            db = DB_ARC,
            power_total = snapshot.power_total,
            energy_total = snapshot.energy_total,
            "arc cycle"
        );
        deps.bridge.publish(BridgeEvent::Arc(snapshot));
        Ok(())
    }

    async fn sensor_cycle(&self) -> smelt_plc::Result<()> {
        let deps = &self.deps;
        let bytes = deps.connection.read_db(DB_SENSOR, 0, db32::SIZE).await?;
        let raw = decode_sensor_block(&bytes)?;
        let hopper = match self.read_hopper().await {
            Ok(hopper) => Some(hopper),
            Err(err) => {
                deps.metrics
                    .record_failure(LoopName::Db32.as_ref(), failure_reason(&err));
                warn!(db = DB_HOPPER, error = %err, "hopper block unavailable this cycle");
                None
            }
        };

        let batch = deps.cache.get_batch_status();
        let outcome = processor::sensor_snapshot(
            &raw,
            hopper.as_ref(),
            &deps.calculators,
            batch.active_code().is_some(),
            Utc::now(),
        );
        deps.cache.set_sensor_data(outcome.snapshot.clone());
        if let Some(code) = batch.active_code() {
            deps.history.write_sensor(&outcome.snapshot, code);
            if let Some(record) = outcome.feeding {
                deps.history.write_feeding_record(&record, code);
                deps.bridge.publish(BridgeEvent::Feeding {
                    batch_code: code.to_owned(),
                    record,
                });
            }
        }
        trace!(db = DB_SENSOR, valve_byte = raw.valve_byte, "sensor cycle");
        deps.bridge.publish(BridgeEvent::Sensor(outcome.snapshot));
        Ok(())
    }

    async fn read_hopper(&self) -> smelt_plc::Result<HopperRaw> {
        let bytes = self
            .deps
            .connection
            .read_db(DB_HOPPER, 0, db19::SIZE)
            .await?;
        Ok(decode_hopper_block(&bytes)?)
    }

    /// Read DB18 and hand the value to the feeding accumulator and the cache.
    /// A failed read stores nothing usable, so the getters fall back to the default.
    async fn refresh_upper_limit(&self) -> bool {
        let deps = &self.deps;
        let raw = match deps
            .connection
            .read_db(DB_HOPPER_LIMIT, db18::UPPER_LIMIT, db18::SIZE)
            .await
        {
            Ok(bytes) => decode_upper_limit(&bytes).map_err(PlcError::from),
            Err(err) => Err(err),
        };
        let (value, ok) = match raw {
            Ok(value) => {
                debug!(
                    db = DB_HOPPER_LIMIT,
                    offset = db18::UPPER_LIMIT,
                    value,
                    "hopper upper limit read"
                );
                (Some(value), true)
            }
            Err(err) => {
                warn!(
                    db = DB_HOPPER_LIMIT,
                    offset = db18::UPPER_LIMIT,
                    error = %err,
                    "hopper upper limit unavailable, using default"
                );
                (None, false)
            }
        };
        deps.calculators.feeding.lock().set_upper_limit_raw(value);
        deps.cache.set_hopper_upper_limit_raw(value);
        ok
    }

    async fn status_cycle(&self) -> smelt_plc::Result<()> {
        let deps = &self.deps;
        let mut blocks = Vec::with_capacity(2);
        for db in [DB_DEVICE_COMM, DB_DEVICE_STATUS] {
            let bytes = deps.connection.read_db(db, 0, devices::size(db)).await?;
            blocks.push(decode_device_block(db, &bytes)?);
        }
        let snapshot =
            processor::status_snapshot(blocks, deps.connection.is_connected(), Utc::now());
        deps.cache.set_status_data(snapshot.clone());
        deps.bridge.publish(BridgeEvent::Status(snapshot));
        Ok(())
    }
}

/// Per-loop state that lives between cycles.
struct Worker {
    name: LoopName,
    upper_limit_due: Option<Instant>,
}

impl Worker {
    fn new(name: LoopName) -> Self {
        Self {
            name,
            upper_limit_due: None,
        }
    }

    async fn cycle(&mut self, shared: &Shared) -> smelt_plc::Result<()> {
        match self.name {
            LoopName::Db1 => shared.arc_cycle().await,
            LoopName::Db32 => {
                let now = Instant::now();
                if self.upper_limit_due.map_or(true, |due| now >= due) {
                    // retried on the next cycle until a read succeeds
                    if shared.refresh_upper_limit().await {
                        self.upper_limit_due = Some(now + shared.settings.upper_limit_refresh);
                    }
                }
                shared.sensor_cycle().await
            }
            LoopName::Status => shared.status_cycle().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arc_interval_follows_the_toggle() {
        let idle = Duration::from_secs(5);
        assert_eq!(arc_interval(false, PollingSpeed::Fast, idle), idle);
        assert_eq!(
            arc_interval(true, PollingSpeed::Fast, idle),
            Duration::from_millis(200)
        );
        assert_eq!(
            arc_interval(true, PollingSpeed::Normal, idle),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn loop_states_round_trip_through_atomics() {
        let states = LoopStates::default();
        assert_eq!(states.get(LoopName::Db32), LoopState::Stopped);
        states.set(LoopName::Db32, LoopState::Reconnecting);
        assert_eq!(states.get(LoopName::Db32), LoopState::Reconnecting);
        assert_eq!(states.get(LoopName::Db1), LoopState::Stopped);
        assert_eq!(LoopName::Status.to_string(), "status");
    }

    #[tokio::test]
    async fn arc_cadence_reacts_to_speed_and_toggle() {
        let speed = PollingConfig::new(PollingSpeed::Normal);
        let (toggle, toggle_rx) = watch::channel(false);
        let mut cadence = Cadence::Arc {
            speed: speed.subscribe(),
            high_speed: toggle_rx,
            idle: Duration::from_secs(5),
        };
        assert_eq!(cadence.period(), Duration::from_secs(5));
        toggle.send_replace(true);
        assert_eq!(cadence.changed().await, Duration::from_millis(500));
        speed.set_polling_speed(PollingSpeed::Fast);
        assert_eq!(cadence.changed().await, Duration::from_millis(200));
    }
}
