//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Process bootstrap wiring the acquisition core together."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use smelt_cache::DataCache;
use smelt_calc::Calculators;
use smelt_common::{AppConfig, BatchStatus, ValveConfig, ValveSettings};
use smelt_history::{HistoryMetrics, HistoryQueryService, HistoryWriter, TimeSeriesStore};
use smelt_metrics::{PollingMetrics, SharedRegistry};
use smelt_plc::{PlcConnection, PlcTransport, PlcWriter, S7Transport};
use smelt_sim::SimulatedPlc;
use tracing::{info, warn};

use crate::batch::{BatchError, BatchService};
use crate::bridge::DataBridge;
use crate::loops::{LoopDeps, PollingLoops};
use crate::polling_config::PollingConfig;
use crate::valves::ValveStore;

/// Every long-lived object of the acquisition core, owned by the process.
#[derive(Debug)]
pub struct FurnaceService {
    config: AppConfig,
    connection: Arc<PlcConnection>,
    writer: PlcWriter,
    cache: Arc<DataCache>,
    calculators: Arc<Calculators>,
    history: Arc<HistoryWriter>,
    query: Arc<HistoryQueryService>,
    polling: PollingConfig,
    loops: PollingLoops,
    batch: BatchService,
    bridge: DataBridge,
    valves: ValveStore,
    registry: Option<SharedRegistry>,
}

impl FurnaceService {
    /// Build the service described by `config`: the simulated furnace in mock
    /// mode, the S7 link otherwise, and the configured history backend.
    ///
    /// Must run inside a tokio runtime. Loops are not started yet.
    pub fn from_config(config: AppConfig, registry: Option<SharedRegistry>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let transport: Box<dyn PlcTransport> = if config.plc.mock {
            info!(
                seed = config.simulation.random_seed,
                "mock mode, reading from the simulated furnace"
            );
            Box::new(SimulatedPlc::new(config.simulation.random_seed))
        } else {
            info!(endpoint = %config.plc.endpoint(), "using S7 fieldbus link");
            Box::new(S7Transport::from_config(&config.plc))
        };
        let store =
            smelt_history::open_store(&config.history).context("failed to open history store")?;
        Self::build(config, transport, store, registry)
    }

    /// Wire the service around an explicit transport and store.
    pub fn build(
        config: AppConfig,
        transport: Box<dyn PlcTransport>,
        store: Arc<dyn TimeSeriesStore>,
        registry: Option<SharedRegistry>,
    ) -> Result<Self> {
        let (polling_metrics, history_metrics) = match &registry {
            Some(registry) => (
                PollingMetrics::new(registry)?,
                HistoryMetrics::new(registry).context("failed to register history metrics")?,
            ),
            None => (
                PollingMetrics::unregistered()?,
                HistoryMetrics::unregistered().context("failed to build history metrics")?,
            ),
        };

        let valves = ValveStore::new(config.valves.path.clone());
        let valve_settings = valves.load_or_default()?;

        let connection = Arc::new(PlcConnection::new(transport, config.plc.io_timeout));
        let cache = Arc::new(DataCache::new(config.polling.history_capacity));
        let calculators = Arc::new(Calculators::new(valve_settings));
        let history = Arc::new(HistoryWriter::spawn(
            Arc::clone(&store),
            config.history.measurement.clone(),
            config.history.queue_capacity,
            history_metrics,
        )
        .with_flush_timeout(config.history.request_timeout));
        let query = Arc::new(HistoryQueryService::new(
            store,
            config.history.measurement.clone(),
        ));
        let bridge = DataBridge::default();
        let polling = PollingConfig::new(config.polling.speed);
        let loops = PollingLoops::new(
            LoopDeps {
                connection: Arc::clone(&connection),
                cache: Arc::clone(&cache),
                calculators: Arc::clone(&calculators),
                history: Arc::clone(&history),
                bridge: bridge.clone(),
                metrics: polling_metrics,
            },
            config.polling.clone(),
            polling.clone(),
        );
        let batch = BatchService::new(
            Arc::clone(&cache),
            Arc::clone(&calculators),
            Arc::clone(&history),
            Arc::clone(&query),
            bridge.clone(),
        );
        let writer = PlcWriter::new(Arc::clone(&connection));

        Ok(Self {
            config,
            connection,
            writer,
            cache,
            calculators,
            history,
            query,
            polling,
            loops,
            batch,
            bridge,
            valves,
            registry,
        })
    }

    /// Connect and spawn the polling loops. An unreachable PLC is not fatal;
    /// the loops keep reconnecting.
    pub async fn start(&self) -> bool {
        if !self.connection.connect().await {
            warn!("PLC not reachable at startup, polling loops will keep retrying");
        }
        self.loops.start_all_polling_loops()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<PlcConnection> {
        &self.connection
    }

    pub fn writer(&self) -> &PlcWriter {
        &self.writer
    }

    pub fn cache(&self) -> &Arc<DataCache> {
        &self.cache
    }

    pub fn calculators(&self) -> &Arc<Calculators> {
        &self.calculators
    }

    pub fn history(&self) -> &Arc<HistoryWriter> {
        &self.history
    }

    pub fn query(&self) -> &Arc<HistoryQueryService> {
        &self.query
    }

    pub fn polling_config(&self) -> &PollingConfig {
        &self.polling
    }

    pub fn loops(&self) -> &PollingLoops {
        &self.loops
    }

    pub fn batch(&self) -> &BatchService {
        &self.batch
    }

    pub fn bridge(&self) -> &DataBridge {
        &self.bridge
    }

    pub fn registry(&self) -> Option<SharedRegistry> {
        self.registry.clone()
    }

    /// Start a run and move DB1 to the smelting cadence.
    pub async fn start_batch(&self, batch_code: &str) -> Result<BatchStatus, BatchError> {
        let status = self.batch.start(batch_code).await?;
        self.loops.switch_db1_speed(true);
        Ok(status)
    }

    /// Finish the run and drop DB1 back to the idle interval.
    pub async fn stop_batch(&self) -> Result<BatchStatus, BatchError> {
        let status = self.batch.stop().await?;
        self.loops.switch_db1_speed(false);
        Ok(status)
    }

    pub async fn abandon_batch(&self, batch_code: &str) -> Result<(), BatchError> {
        self.batch.abandon(batch_code).await?;
        if !self.batch.get_status().is_smelting {
            self.loops.switch_db1_speed(false);
        }
        Ok(())
    }

    /// Apply new travel times for `valve_id` (1-based) to the live calculator
    /// and persist the full calibration.
    pub fn update_valve_config(
        &self,
        valve_id: usize,
        config: ValveConfig,
    ) -> Result<ValveSettings> {
        if !config.is_valid() {
            bail!("valve {valve_id}: travel times must be positive and finite, got {config:?}");
        }
        let settings = {
            let mut valves = self.calculators.valves.lock();
            if !valves.set_config(valve_id, config) {
                bail!("unknown valve {valve_id}");
            }
            valves.settings()
        };
        self.valves
            .save(&settings)
            .with_context(|| format!("valve {valve_id} updated but not persisted"))?;
        info!(
            valve_id,
            full_open_time_s = config.full_open_time_s,
            full_close_time_s = config.full_close_time_s,
            "valve calibration updated"
        );
        Ok(settings)
    }

    /// Stop the loops, drain buffered state and queued history, then close
    /// the PLC session. Every step is bounded by the join timeout.
    pub async fn shutdown(&self) {
        let timeout = self.config.polling.join_timeout;
        self.loops.shutdown().await;
        match tokio::time::timeout(timeout, self.batch.force_flush_all_caches()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "final flush failed"),
            Err(_) => warn!(?timeout, "final flush timed out"),
        }
        self.history.shutdown(timeout).await;
        self.connection.disconnect().await;
        info!("furnace service stopped");
    }
}
