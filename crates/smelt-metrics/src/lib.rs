//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export for the furnace daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
///
/// Binding to port 0 picks a free port; [`MetricsServer::addr`] reports it.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get(move || metrics_handler(Arc::clone(&registry))),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("metrics listener has no local address")?;
    let listener = TcpListener::from_std(std_listener)
        .context("failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics exporter listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics exporter stopped with an error")
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "smeltd_starts_total",
            "Total number of times the furnace daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "smeltd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 12)?),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("smeltd_build_info", "Build metadata and PLC mode of the daemon"),
            &["version", "profile", "mode"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str, mode: &str) {
        self.build_info
            .with_label_values(&[version, profile, mode])
            .set(1.0);
    }
}

/// Per-loop health of the acquisition pipeline.
#[derive(Clone)]
pub struct PollingMetrics {
    cycles: IntCounterVec,
    failures: IntCounterVec,
    cycle_seconds: HistogramVec,
    loop_running: IntGaugeVec,
    plc_connected: IntGauge,
}

impl PollingMetrics {
    /// Collectors that are not exported anywhere; used when metrics are disabled.
    pub fn unregistered() -> Result<Self> {
        Ok(Self {
            cycles: IntCounterVec::new(
                Opts::new("smelt_poll_cycles_total", "Completed polling cycles by loop"),
                &["loop"],
            )?,
            failures: IntCounterVec::new(
                Opts::new(
                    "smelt_poll_failures_total",
                    "Skipped polling cycles by loop and reason",
                ),
                &["loop", "reason"],
            )?,
            cycle_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "smelt_poll_cycle_seconds",
                    "Time spent reading, decoding and publishing one cycle",
                )
                .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?),
                &["loop"],
            )?,
            loop_running: IntGaugeVec::new(
                Opts::new("smelt_poll_loop_running", "Indicator (0/1) per polling loop"),
                &["loop"],
            )?,
            plc_connected: IntGauge::with_opts(Opts::new(
                "smelt_plc_connected",
                "Indicator (0/1) whether the PLC session is up",
            ))?,
        })
    }

    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.cycles.clone()))?;
        registry.register(Box::new(metrics.failures.clone()))?;
        registry.register(Box::new(metrics.cycle_seconds.clone()))?;
        registry.register(Box::new(metrics.loop_running.clone()))?;
        registry.register(Box::new(metrics.plc_connected.clone()))?;
        Ok(metrics)
    }

    pub fn record_cycle(&self, loop_name: &str, seconds: f64) {
        self.cycles.with_label_values(&[loop_name]).inc();
        self.cycle_seconds
            .with_label_values(&[loop_name])
            .observe(seconds);
    }

    pub fn record_failure(&self, loop_name: &str, reason: &str) {
        self.failures.with_label_values(&[loop_name, reason]).inc();
    }

    pub fn set_running(&self, loop_name: &str, running: bool) {
        self.loop_running
            .with_label_values(&[loop_name])
            .set(i64::from(running));
    }

    pub fn set_plc_connected(&self, connected: bool) {
        self.plc_connected.set(i64::from(connected));
    }

    pub fn plc_connected(&self) -> bool {
        self.plc_connected.get() == 1
    }

    pub fn cycles(&self, loop_name: &str) -> u64 {
        self.cycles.with_label_values(&[loop_name]).get()
    }

    pub fn failures(&self, loop_name: &str, reason: &str) -> u64 {
        self.failures.with_label_values(&[loop_name, reason]).get()
    }
}

impl std::fmt::Debug for PollingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingMetrics").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn exporter_serves_registered_collectors() {
        let registry = new_registry();
        let polling = PollingMetrics::new(&registry).unwrap();
        polling.record_cycle("db1", 0.004);
        polling.set_plc_connected(true);

        let server = spawn_http_server(Arc::clone(&registry), "127.0.0.1:0".parse().unwrap())
            .unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response
            .to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"));
        assert!(response.contains("smelt_poll_cycles_total{loop=\"db1\"} 1"));
        assert!(response.contains("smelt_plc_connected 1"));
        server.shutdown().await.unwrap();
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Registry::new();
        PollingMetrics::new(&registry).unwrap();
        assert!(PollingMetrics::new(&registry).is_err());
    }
}
