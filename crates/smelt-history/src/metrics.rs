//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batch-tagged time-series history for the furnace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the history writer.
#[derive(Clone)]
pub struct HistoryMetrics {
    points_written: IntCounterVec,
    write_failures: IntCounter,
    queue_drops: IntCounter,
}

impl HistoryMetrics {
    /// Counters that are not exported anywhere; used when metrics are disabled.
    pub fn unregistered() -> Result<Self> {
        Ok(Self {
            points_written: IntCounterVec::new(
                Opts::new(
                    "smelt_history_points_written_total",
                    "Total number of points accepted by the history store",
                ),
                &["store"],
            )?,
            write_failures: IntCounter::new(
                "smelt_history_write_failures_total",
                "Total number of history write batches rejected or lost in transit",
            )?,
            queue_drops: IntCounter::new(
                "smelt_history_queue_drops_total",
                "Total number of history batches dropped because the writer queue was full",
            )?,
        })
    }

    /// Register all history metrics with the provided registry.
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.points_written.clone()))?;
        registry.register(Box::new(metrics.write_failures.clone()))?;
        registry.register(Box::new(metrics.queue_drops.clone()))?;
        Ok(metrics)
    }

    pub fn record_written(&self, store: &str, points: usize) {
        self.points_written
            .with_label_values(&[store])
            .inc_by(points as u64);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.inc();
    }

    pub fn record_queue_drop(&self) {
        self.queue_drops.inc();
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.get()
    }

    pub fn queue_drops(&self) -> u64 {
        self.queue_drops.get()
    }
}

impl std::fmt::Debug for HistoryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryMetrics").finish_non_exhaustive()
    }
}
