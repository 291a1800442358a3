//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batch-tagged time-series history for the furnace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Best-effort history writer.
//!
//! Polling loops hand points to a bounded queue and return immediately. A
//! background task drains the queue into the store; failures are logged and
//! counted, never reported back to the caller.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smelt_common::{ArcSnapshot, FeedingRecord, SensorSnapshot};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::HistoryMetrics;
use crate::point::{arc_points, feeding_point, sensor_points, Point};
use crate::store::TimeSeriesStore;
use crate::{HistoryError, Result};

const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Points(Vec<Point>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug)]
pub struct HistoryWriter {
    tx: mpsc::Sender<Command>,
    measurement: String,
    metrics: HistoryMetrics,
    flush_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryWriter {
    /// Start the drain task on the current runtime.
    pub fn spawn(
        store: Arc<dyn TimeSeriesStore>,
        measurement: impl Into<String>,
        capacity: usize,
        metrics: HistoryMetrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(drain(store, rx, metrics.clone()));
        Self {
            tx,
            measurement: measurement.into(),
            metrics,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            task: Mutex::new(Some(task)),
        }
    }

    /// Upper bound for [`flush`](Self::flush), queueing included.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn metrics(&self) -> &HistoryMetrics {
        &self.metrics
    }

    /// Queue one arc cycle. Returns false when the point batch was dropped.
    pub fn write_arc(&self, snapshot: &ArcSnapshot, batch_code: &str) -> bool {
        self.enqueue(arc_points(&self.measurement, batch_code, snapshot))
    }

    /// Queue one sensor cycle. Returns false when the point batch was dropped.
    pub fn write_sensor(&self, snapshot: &SensorSnapshot, batch_code: &str) -> bool {
        self.enqueue(sensor_points(&self.measurement, batch_code, snapshot))
    }

    pub fn write_feeding_record(&self, record: &FeedingRecord, batch_code: &str) -> bool {
        self.enqueue(feeding_point(batch_code, record))
    }

    fn enqueue(&self, points: Vec<Point>) -> bool {
        if points.is_empty() {
            return true;
        }
        match self.tx.try_send(Command::Points(points)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_queue_drop();
                warn!("history queue full, dropping cycle");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("history writer closed, dropping cycle");
                false
            }
        }
    }

    /// Wait until everything queued before this call has reached the store,
    /// or fail with [`HistoryError::Timeout`] after the flush timeout.
    pub async fn flush(&self) -> Result<()> {
        let flushed = async {
            let (ack, done) = oneshot::channel();
            self.tx
                .send(Command::Flush(ack))
                .await
                .map_err(|_| HistoryError::Closed)?;
            done.await.map_err(|_| HistoryError::Closed)
        };
        tokio::time::timeout(self.flush_timeout, flushed)
            .await
            .map_err(|_| HistoryError::Timeout(self.flush_timeout))?
    }

    /// Drain the queue and stop the task, aborting it once `timeout` has
    /// passed. Queueing the stop request counts against the same timeout.
    pub async fn shutdown(&self, timeout: Duration) {
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return;
        };
        let drained = async {
            let _ = self.tx.send(Command::Shutdown).await;
            let _ = (&mut task).await;
        };
        if tokio::time::timeout(timeout, drained).await.is_err() {
            warn!(?timeout, "history writer did not drain in time");
            task.abort();
        }
    }
}

async fn drain(
    store: Arc<dyn TimeSeriesStore>,
    mut rx: mpsc::Receiver<Command>,
    metrics: HistoryMetrics,
) {
    info!(store = store.name(), "history writer started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Points(points) => match store.write(&points).await {
                Ok(()) => metrics.record_written(store.name(), points.len()),
                Err(err) => {
                    metrics.record_write_failure();
                    warn!(error = %err, points = points.len(), "history write failed");
                }
            },
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => break,
        }
    }
    info!("history writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::{SeriesPoint, SeriesQuery};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Semaphore;

    #[derive(Debug)]
    struct FailingStore;

    #[async_trait]
    impl TimeSeriesStore for FailingStore {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn write(&self, _points: &[Point]) -> Result<()> {
            Err(HistoryError::Query("store offline".into()))
        }

        async fn query(&self, _query: &SeriesQuery) -> Result<Vec<SeriesPoint>> {
            Ok(Vec::new())
        }

        async fn first_seen_by_tag(
            &self,
            _measurement: &str,
            _tag: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<(String, DateTime<Utc>)>> {
            Ok(Vec::new())
        }

        async fn delete_by_tag(&self, _m: &str, _t: &str, _v: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Blocks every write until a permit is released.
    #[derive(Debug)]
    struct GatedStore {
        gate: Arc<Semaphore>,
        inner: MemoryStore,
    }

    #[async_trait]
    impl TimeSeriesStore for GatedStore {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn write(&self, points: &[Point]) -> Result<()> {
            let permit = self.gate.acquire().await.map_err(|_| HistoryError::Closed)?;
            permit.forget();
            self.inner.write(points).await
        }

        async fn query(&self, query: &SeriesQuery) -> Result<Vec<SeriesPoint>> {
            self.inner.query(query).await
        }

        async fn first_seen_by_tag(
            &self,
            measurement: &str,
            tag: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<(String, DateTime<Utc>)>> {
            self.inner.first_seen_by_tag(measurement, tag, since).await
        }

        async fn delete_by_tag(&self, m: &str, t: &str, v: &str) -> Result<()> {
            self.inner.delete_by_tag(m, t, v).await
        }
    }

    fn record(weight: f64) -> FeedingRecord {
        FeedingRecord {
            timestamp: Utc::now(),
            discharge_weight: weight,
        }
    }

    #[tokio::test]
    async fn flush_waits_for_queued_points() {
        let store = MemoryStore::new();
        let writer = HistoryWriter::spawn(
            Arc::new(store.clone()),
            "sensor_data",
            16,
            HistoryMetrics::unregistered().unwrap(),
        );
        assert!(writer.write_feeding_record(&record(120.0), "B-1"));
        assert!(writer.write_feeding_record(&record(85.0), "B-1"));
        writer.flush().await.unwrap();
        assert_eq!(store.len(), 2);
        writer.shutdown(Duration::from_secs(1)).await;
        assert!(!writer.write_feeding_record(&record(1.0), "B-1"));
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let writer = HistoryWriter::spawn(
            Arc::new(FailingStore),
            "sensor_data",
            4,
            HistoryMetrics::unregistered().unwrap(),
        );
        assert!(writer.write_feeding_record(&record(10.0), "B-1"));
        writer.flush().await.unwrap();
        assert_eq!(writer.metrics().write_failures(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let gate = Arc::new(Semaphore::new(0));
        let inner = MemoryStore::new();
        let writer = HistoryWriter::spawn(
            Arc::new(GatedStore {
                gate: Arc::clone(&gate),
                inner: inner.clone(),
            }),
            "sensor_data",
            1,
            HistoryMetrics::unregistered().unwrap(),
        );
        // the first batch is taken by the drain task and parks on the gate
        assert!(writer.write_feeding_record(&record(1.0), "B-1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(writer.write_feeding_record(&record(2.0), "B-1"));
        assert!(!writer.write_feeding_record(&record(3.0), "B-1"));
        assert_eq!(writer.metrics().queue_drops(), 1);

        gate.add_permits(2);
        writer.flush().await.unwrap();
        assert_eq!(inner.len(), 2);
    }

    #[tokio::test]
    async fn flush_and_shutdown_are_bounded_by_a_hung_store() {
        let gate = Arc::new(Semaphore::new(0));
        let writer = HistoryWriter::spawn(
            Arc::new(GatedStore {
                gate: Arc::clone(&gate),
                inner: MemoryStore::new(),
            }),
            "sensor_data",
            1,
            HistoryMetrics::unregistered().unwrap(),
        )
        .with_flush_timeout(Duration::from_millis(100));
        // one batch parks in the store, the next fills the queue
        assert!(writer.write_feeding_record(&record(1.0), "B-1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(writer.write_feeding_record(&record(2.0), "B-1"));

        let started = std::time::Instant::now();
        assert!(matches!(writer.flush().await, Err(HistoryError::Timeout(_))));
        writer.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!writer.write_feeding_record(&record(3.0), "B-1"));
    }
}
