//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the furnace acquisition daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smelt_common::{init_tracing, AppConfig, HistoryBackend};
use smelt_core::FurnaceService;
use smelt_history::HistoryQueryService;
use smelt_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "configs/example.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("smeltd ", env!("CARGO_PKG_VERSION")),
    about = "Smelting furnace acquisition daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Read from the simulated furnace instead of the PLC")]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the polling loops until interrupted")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "List recent batches from the history store")]
    Batches {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let mut config = loaded.config;
    if cli.mock {
        config.plc.mock = true;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("smeltd", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config, load_duration.as_secs_f64()).await?
        }
        Commands::CheckConfig => {
            println!(
                "{}: ok (plc {}, mock {}, history {:?})",
                loaded.source.display(),
                config.plc.endpoint(),
                config.plc.mock,
                config.history.backend
            );
        }
        Commands::Batches { limit } => {
            if config.history.backend != HistoryBackend::Influx {
                eprintln!(
                    "history backend {:?} keeps no batches between runs",
                    config.history.backend
                );
            }
            let store = smelt_history::open_store(&config.history)?;
            let query = HistoryQueryService::new(store, config.history.measurement.clone());
            let batches = query
                .get_batch_list(limit)
                .await
                .context("failed to list batches")?;
            println!("{}", serde_json::to_string_pretty(&batches)?);
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, config_load_seconds: f64) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let mode = if config.plc.mock { "mock" } else { "plc" };

    let (registry, metrics_server) = if metrics_settings.enabled {
        let registry = new_registry();
        let daemon_metrics = DaemonMetrics::new(&registry)?;
        daemon_metrics.observe_config_load(config_load_seconds);
        daemon_metrics.inc_start();
        let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
        daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), profile, mode);
        let server = spawn_http_server(registry.clone(), metrics_settings.listen)?;
        (Some(registry), Some(server))
    } else {
        info!("metrics exporter disabled by configuration");
        (None, None)
    };

    let service = FurnaceService::from_config(config, registry)?;
    if !service.start().await {
        warn!("polling loops were already running");
    }

    info!(mode, "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    service.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}
