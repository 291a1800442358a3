//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batch-tagged time-series history for the furnace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Time-series persistence: snapshot mapping, storage backends, the
//! best-effort writer queue and the batch query service.

use std::sync::Arc;

use smelt_common::{HistoryBackend, HistoryConfig};

/// Result alias used throughout the history crate.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Error type for the history subsystem.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Transport-level HTTP failure talking to the store.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The store answered with a non-success status.
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    /// Malformed annotated CSV in a query response.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Invalid store URL in configuration.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    /// A query could not be built or its result interpreted.
    #[error("query error: {0}")]
    Query(String),
    /// The writer task has stopped.
    #[error("history writer closed")]
    Closed,
    /// The writer did not drain within the allowed time.
    #[error("history writer did not drain within {0:?}")]
    Timeout(std::time::Duration),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub mod influx;
pub mod memory;
pub mod metrics;
pub mod point;
pub mod query;
pub mod store;
pub mod writer;

pub use influx::InfluxStore;
pub use memory::MemoryStore;
pub use metrics::HistoryMetrics;
pub use point::{arc_points, feeding_point, sensor_points, ModuleType, Point};
pub use query::{
    aggregation_interval, BatchStatistics, BatchSummary, BatchTimeRange, FeedingEvent,
    HistoryQueryService, QueryRange, Series, TimeValue,
};
pub use store::{Aggregation, NullStore, SeriesPoint, SeriesQuery, TimeSeriesStore};
pub use writer::HistoryWriter;

/// Build the store selected by configuration.
pub fn open_store(config: &HistoryConfig) -> Result<Arc<dyn TimeSeriesStore>> {
    let store: Arc<dyn TimeSeriesStore> = match config.backend {
        HistoryBackend::Memory => Arc::new(MemoryStore::new()),
        HistoryBackend::Influx => Arc::new(InfluxStore::from_config(config)?),
        HistoryBackend::Disabled => Arc::new(NullStore),
    };
    tracing::info!(backend = store.name(), "history store opened");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_is_readable() {
        let err = HistoryError::Status {
            status: 401,
            body: "unauthorized access".into(),
        };
        assert_eq!(format!("{err}"), "store returned 401: unauthorized access");
    }

    #[test]
    fn disabled_backend_opens_null_store() {
        let config = HistoryConfig {
            backend: HistoryBackend::Disabled,
            ..HistoryConfig::default()
        };
        assert_eq!(open_store(&config).unwrap().name(), "disabled");
    }
}
