//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Smelting batch lifecycle hooks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::Utc;
use smelt_cache::DataCache;
use smelt_calc::Calculators;
use smelt_common::time::seconds_between;
use smelt_common::{BatchStatus, ValveOpenness};
use smelt_history::{HistoryError, HistoryQueryService, HistoryWriter};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bridge::{BridgeEvent, DataBridge};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch code must not be empty")]
    EmptyCode,
    #[error("batch {active} is already running")]
    AlreadyRunning { active: String },
    #[error("no batch is running")]
    NotRunning,
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Start, stop and abandon smelting runs.
///
/// The current [`BatchStatus`] lives in the [`DataCache`], where the polling
/// loops read it to decide whether a cycle is persisted.
#[derive(Debug)]
pub struct BatchService {
    cache: Arc<DataCache>,
    calculators: Arc<Calculators>,
    history: Arc<HistoryWriter>,
    query: Arc<HistoryQueryService>,
    bridge: DataBridge,
    lifecycle: Mutex<()>,
}

impl BatchService {
    pub fn new(
        cache: Arc<DataCache>,
        calculators: Arc<Calculators>,
        history: Arc<HistoryWriter>,
        query: Arc<HistoryQueryService>,
        bridge: DataBridge,
    ) -> Self {
        Self {
            cache,
            calculators,
            history,
            query,
            bridge,
            lifecycle: Mutex::new(()),
        }
    }

    /// Current run, with the elapsed time computed now.
    pub fn get_status(&self) -> BatchStatus {
        let mut status = self.cache.get_batch_status();
        if let (true, Some(start)) = (status.is_smelting, status.start_time) {
            status.elapsed_seconds = seconds_between(start, Utc::now()).max(0.0);
        }
        status
    }

    /// Begin `batch_code`. Batch-scoped totals restart from zero; starting the
    /// run that is already active is a no-op.
    pub async fn start(&self, batch_code: &str) -> Result<BatchStatus, BatchError> {
        let code = batch_code.trim();
        if code.is_empty() {
            return Err(BatchError::EmptyCode);
        }
        let _guard = self.lifecycle.lock().await;
        let current = self.get_status();
        match current.active_code() {
            Some(active) if active == code => return Ok(current),
            Some(active) => {
                return Err(BatchError::AlreadyRunning {
                    active: active.to_owned(),
                })
            }
            None => {}
        }

        self.calculators.reset_batch_totals();
        let status = BatchStatus {
            is_smelting: true,
            batch_code: Some(code.to_owned()),
            start_time: Some(Utc::now()),
            elapsed_seconds: 0.0,
        };
        self.cache.set_batch_status(status.clone());
        self.bridge.publish(BridgeEvent::Batch(status.clone()));
        info!(batch_code = code, "batch started");
        Ok(status)
    }

    /// End the active run after draining buffered state into it. Returns the
    /// final status of the finished run.
    pub async fn stop(&self) -> Result<BatchStatus, BatchError> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<BatchStatus, BatchError> {
        if self.get_status().active_code().is_none() {
            return Err(BatchError::NotRunning);
        }
        if let Err(err) = self.force_flush_all_caches().await {
            warn!(error = %err, "flush before batch stop failed");
        }
        let mut finished = self.get_status();
        finished.is_smelting = false;
        self.cache.set_batch_status(BatchStatus::default());
        self.bridge.publish(BridgeEvent::Batch(BatchStatus::default()));
        info!(
            batch_code = finished.batch_code.as_deref().unwrap_or_default(),
            elapsed_seconds = finished.elapsed_seconds,
            "batch stopped"
        );
        Ok(finished)
    }

    /// Throw a run away and delete its history. When it is the active run it is
    /// stopped first and the cache is wiped so no residual readings stay on
    /// display; abandoning a past run leaves the live state alone.
    pub async fn abandon(&self, batch_code: &str) -> Result<(), BatchError> {
        let code = batch_code.trim();
        if code.is_empty() {
            return Err(BatchError::EmptyCode);
        }
        let _guard = self.lifecycle.lock().await;
        let was_active = self.get_status().active_code() == Some(code);
        if was_active {
            self.stop_locked().await?;
        }
        self.query.delete_batch_data(code).await?;
        if was_active {
            self.cache.clear();
            self.bridge.publish(BridgeEvent::Batch(BatchStatus::default()));
        }
        warn!(batch_code = code, was_active, "batch abandoned and its history deleted");
        Ok(())
    }

    /// Integrate buffered valve samples into the cached sensor snapshot and
    /// wait until queued history points have reached the store.
    pub async fn force_flush_all_caches(&self) -> Result<ValveOpenness, BatchError> {
        let openness = self.calculators.valves.lock().flush_valve_openness_buffers();
        if let Some(mut sensor) = self.cache.get_sensor_data() {
            sensor.valve_openness = openness;
            if let Some(code) = self.cache.get_batch_status().active_code() {
                self.history.write_sensor(&sensor, code);
            }
            self.cache.set_sensor_data(sensor);
        }
        self.history.flush().await?;
        Ok(openness)
    }
}
