//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Realtime data cache for the furnace pipeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Latest-value and recent-history store read by the UI.
//!
//! The latest arc, sensor and status snapshots live behind one lock so a
//! realtime read always sees a single consistent instant. Histories are
//! bounded deques; the oldest entry is dropped on overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use smelt_calc::effective_upper_limit;
use smelt_common::{ArcSnapshot, BatchStatus, SensorSnapshot, StatusSnapshot};
use tracing::{debug, info};

/// Default number of entries kept per history deque.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// One history entry: a snapshot and the time it was cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

/// Everything the realtime screen needs, captured at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeDisplayData {
    pub arc: Option<ArcSnapshot>,
    pub sensor: Option<SensorSnapshot>,
    pub status: Option<StatusSnapshot>,
    pub batch: BatchStatus,
    pub hopper_upper_limit: i32,
    pub captured_at: DateTime<Utc>,
}

/// Cache introspection for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub has_arc: bool,
    pub has_sensor: bool,
    pub has_status: bool,
    pub arc_history_len: usize,
    pub sensor_history_len: usize,
    pub history_capacity: usize,
    pub arc_updates: u64,
    pub sensor_updates: u64,
    pub status_updates: u64,
    pub is_smelting: bool,
    pub batch_code: Option<String>,
    pub hopper_upper_limit: i32,
    pub last_arc_update: Option<DateTime<Utc>>,
    pub last_sensor_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Latest {
    arc: Option<Arc<ArcSnapshot>>,
    sensor: Option<Arc<SensorSnapshot>>,
    status: Option<Arc<StatusSnapshot>>,
    arc_at: Option<DateTime<Utc>>,
    sensor_at: Option<DateTime<Utc>>,
}

/// Thread-safe cache shared by the polling loops and the interface layer.
#[derive(Debug)]
pub struct DataCache {
    capacity: usize,
    latest: RwLock<Latest>,
    arc_history: Mutex<VecDeque<HistoryEntry<Arc<ArcSnapshot>>>>,
    sensor_history: Mutex<VecDeque<HistoryEntry<Arc<SensorSnapshot>>>>,
    batch: RwLock<BatchStatus>,
    upper_limit_raw: RwLock<Option<i32>>,
    arc_updates: AtomicU64,
    sensor_updates: AtomicU64,
    status_updates: AtomicU64,
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl DataCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            latest: RwLock::new(Latest::default()),
            arc_history: Mutex::new(VecDeque::with_capacity(capacity)),
            sensor_history: Mutex::new(VecDeque::with_capacity(capacity)),
            batch: RwLock::new(BatchStatus::default()),
            upper_limit_raw: RwLock::new(None),
            arc_updates: AtomicU64::new(0),
            sensor_updates: AtomicU64::new(0),
            status_updates: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_arc_data(&self, snapshot: ArcSnapshot) {
        let now = Utc::now();
        let snapshot = Arc::new(snapshot);
        {
            let mut latest = self.latest.write();
            latest.arc = Some(Arc::clone(&snapshot));
            latest.arc_at = Some(now);
        }
        push_bounded(
            &mut self.arc_history.lock(),
            HistoryEntry {
                data: snapshot,
                timestamp: now,
            },
            self.capacity,
        );
        self.arc_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_arc_data(&self) -> Option<ArcSnapshot> {
        self.latest.read().arc.as_deref().cloned()
    }

    /// The last `count` arc entries, oldest first.
    pub fn get_arc_history(&self, count: usize) -> Vec<HistoryEntry<ArcSnapshot>> {
        tail(&self.arc_history.lock(), count)
    }

    pub fn set_sensor_data(&self, snapshot: SensorSnapshot) {
        let now = Utc::now();
        let snapshot = Arc::new(snapshot);
        {
            let mut latest = self.latest.write();
            latest.sensor = Some(Arc::clone(&snapshot));
            latest.sensor_at = Some(now);
        }
        push_bounded(
            &mut self.sensor_history.lock(),
            HistoryEntry {
                data: snapshot,
                timestamp: now,
            },
            self.capacity,
        );
        self.sensor_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_sensor_data(&self) -> Option<SensorSnapshot> {
        self.latest.read().sensor.as_deref().cloned()
    }

    /// The last `count` sensor entries, oldest first.
    pub fn get_sensor_history(&self, count: usize) -> Vec<HistoryEntry<SensorSnapshot>> {
        tail(&self.sensor_history.lock(), count)
    }

    pub fn set_status_data(&self, snapshot: StatusSnapshot) {
        self.latest.write().status = Some(Arc::new(snapshot));
        self.status_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_status_data(&self) -> Option<StatusSnapshot> {
        self.latest.read().status.as_deref().cloned()
    }

    pub fn set_batch_status(&self, status: BatchStatus) {
        *self.batch.write() = status;
    }

    pub fn get_batch_status(&self) -> BatchStatus {
        self.batch.read().clone()
    }

    /// Store the latest raw DB18 upper limit; `None` when the read failed.
    pub fn set_hopper_upper_limit_raw(&self, raw: Option<i32>) {
        *self.upper_limit_raw.write() = raw;
    }

    /// Effective upper limit, falling back to the default when the raw value is unusable.
    pub fn get_hopper_upper_limit(&self) -> i32 {
        effective_upper_limit(*self.upper_limit_raw.read())
    }

    /// Arc, sensor and status as of one instant.
    pub fn get_realtime_display_data(&self) -> RealtimeDisplayData {
        let (arc, sensor, status) = {
            let latest = self.latest.read();
            (latest.arc.clone(), latest.sensor.clone(), latest.status.clone())
        };
        RealtimeDisplayData {
            arc: arc.as_deref().cloned(),
            sensor: sensor.as_deref().cloned(),
            status: status.as_deref().cloned(),
            batch: self.get_batch_status(),
            hopper_upper_limit: self.get_hopper_upper_limit(),
            captured_at: Utc::now(),
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        let (has_arc, has_sensor, has_status, last_arc_update, last_sensor_update) = {
            let latest = self.latest.read();
            (
                latest.arc.is_some(),
                latest.sensor.is_some(),
                latest.status.is_some(),
                latest.arc_at,
                latest.sensor_at,
            )
        };
        let batch = self.get_batch_status();
        CacheStats {
            has_arc,
            has_sensor,
            has_status,
            arc_history_len: self.arc_history.lock().len(),
            sensor_history_len: self.sensor_history.lock().len(),
            history_capacity: self.capacity,
            arc_updates: self.arc_updates.load(Ordering::Relaxed),
            sensor_updates: self.sensor_updates.load(Ordering::Relaxed),
            status_updates: self.status_updates.load(Ordering::Relaxed),
            is_smelting: batch.is_smelting,
            batch_code: batch.batch_code,
            hopper_upper_limit: self.get_hopper_upper_limit(),
            last_arc_update,
            last_sensor_update,
        }
    }

    /// Drop every cached reading and counter. The hopper upper limit is PLC
    /// configuration rather than a reading and survives until the next refresh.
    pub fn clear(&self) {
        *self.latest.write() = Latest::default();
        self.arc_history.lock().clear();
        self.sensor_history.lock().clear();
        *self.batch.write() = BatchStatus::default();
        self.arc_updates.store(0, Ordering::Relaxed);
        self.sensor_updates.store(0, Ordering::Relaxed);
        self.status_updates.store(0, Ordering::Relaxed);
        info!("data cache cleared");
    }
}

fn push_bounded<T>(deque: &mut VecDeque<T>, entry: T, capacity: usize) {
    if deque.len() >= capacity {
        deque.pop_front();
        debug!(capacity, "cache history full, dropping oldest entry");
    }
    deque.push_back(entry);
}

fn tail<T: Clone>(deque: &VecDeque<HistoryEntry<Arc<T>>>, count: usize) -> Vec<HistoryEntry<T>> {
    let skip = deque.len().saturating_sub(count);
    deque
        .iter()
        .skip(skip)
        .map(|entry| HistoryEntry {
            data: entry.data.as_ref().clone(),
            timestamp: entry.timestamp,
        })
        .collect()
}
