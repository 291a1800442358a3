//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing bootstrap for the furnace daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{self, format::Writer, time::FormatTime};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;
use crate::time::to_local;

const LOG_ENV: &str = "SMELT_LOG";
/// The InfluxDB client logs every request at debug.
const DEFAULT_DIRECTIVE: &str = "info,hyper=warn,reqwest=warn";

static GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Plant-local wall clock for the console, matching the operator screens.
#[derive(Debug, Clone, Copy, Default)]
struct PlantTime;

impl FormatTime for PlantTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", to_local(Utc::now()).format("%Y-%m-%d %H:%M:%S%.3f%:z"))
    }
}

/// `SMELT_LOG`, then `RUST_LOG`, then the built-in default.
fn build_filter(smelt_log: Option<String>) -> EnvFilter {
    match smelt_log {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {LOG_ENV} directive {directive:?} ({err}); using {DEFAULT_DIRECTIVE}"
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

/// Install the global subscriber.
///
/// * `SMELT_LOG` overrides the filter (e.g. `smelt_core=debug`). When unset the
///   standard `RUST_LOG` variable is honoured, finally defaulting to `info`. Poll loops
///   run up to five times a second, so `debug` is opt-in.
/// * Stdout follows the configured format. The daily rolling file is always JSON with
///   UTC timestamps so it lines up with the history store.
///
/// Calling it again is harmless; the first subscriber stays installed.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let console = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .with_current_span(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .compact()
            .with_target(true)
            .with_timer(PlantTime)
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(build_filter(std::env::var(LOG_ENV).ok()))
        .with(console)
        .with(file)
        .try_init();
    if installed.is_err() {
        debug!(service = service_name, "tracing already initialised");
        return Ok(());
    }
    let _ = GUARDS.set([file_guard, stdout_guard]);

    info!(
        service = service_name,
        log_dir = %config.directory.display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}
