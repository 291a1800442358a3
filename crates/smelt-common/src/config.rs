//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the furnace acquisition core."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;
use crate::model::PollingSpeed;

fn default_plc_port() -> u16 {
    102
}

fn default_plc_slot() -> u16 {
    1
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_db32_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_upper_limit_refresh() -> Duration {
    Duration::from_secs(10)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_initial() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(10)
}

fn default_history_capacity() -> usize {
    1000
}

fn default_history_url() -> String {
    "http://localhost:8086".to_owned()
}

fn default_history_org() -> String {
    "furnace".to_owned()
}

fn default_history_bucket() -> String {
    "sensor_data".to_owned()
}

fn default_history_measurement() -> String {
    "sensor_data".to_owned()
}

fn default_queue_capacity() -> usize {
    512
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_valve_path() -> PathBuf {
    PathBuf::from("data/valve_config.json")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_simulation_seed() -> u64 {
    0x5E17u64
}

/// Structural problems that make startup impossible.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("plc.address must be set unless plc.mock is enabled")]
    MissingPlcAddress,
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Primary configuration object for the acquisition daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub plc: PlcConfig,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub valves: ValveStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "SMELT_CONFIG";

    /// Load configuration from disk, respecting the `SMELT_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.plc.validate()?;
        self.polling.validate()?;
        self.history.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Fieldbus endpoint of the furnace PLC.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_plc_port")]
    pub port: u16,
    #[serde(default)]
    pub rack: u16,
    #[serde(default = "default_plc_slot")]
    pub slot: u16,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_io_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub io_timeout: Duration,
    /// Replace the fieldbus with the simulated furnace.
    #[serde(default)]
    pub mock: bool,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_plc_port(),
            rack: 0,
            slot: default_plc_slot(),
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
            mock: false,
        }
    }
}

impl PlcConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.mock && self.address.trim().is_empty() {
            return Err(ConfigError::MissingPlcAddress);
        }
        if self.io_timeout.is_zero() {
            return Err(ConfigError::invalid("plc.io_timeout", "must be positive"));
        }
        if self.rack > 7 || self.slot > 31 {
            return Err(ConfigError::invalid(
                "plc.rack/plc.slot",
                format!("rack {} slot {} out of range", self.rack, self.slot),
            ));
        }
        Ok(())
    }

    /// `host:port` socket string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address.trim(), self.port)
    }
}

/// Cadences of the polling loops.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Initial arc refresh speed while smelting.
    #[serde(default)]
    pub speed: PollingSpeed,
    /// Arc loop interval outside of a smelting run.
    #[serde(default = "default_idle_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_interval: Duration,
    #[serde(default = "default_db32_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub db32_interval: Duration,
    #[serde(default = "default_status_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub status_interval: Duration,
    #[serde(default = "default_upper_limit_refresh")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub upper_limit_refresh: Duration,
    #[serde(default = "default_join_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub join_timeout: Duration,
    #[serde(default = "default_backoff_initial")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_backoff_initial: Duration,
    #[serde(default = "default_backoff_max")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_backoff_max: Duration,
    /// Entries kept per cache history deque.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            speed: PollingSpeed::default(),
            idle_interval: default_idle_interval(),
            db32_interval: default_db32_interval(),
            status_interval: default_status_interval(),
            upper_limit_refresh: default_upper_limit_refresh(),
            join_timeout: default_join_timeout(),
            reconnect_backoff_initial: default_backoff_initial(),
            reconnect_backoff_max: default_backoff_max(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl PollingSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (field, value) in [
            ("polling.idle_interval", self.idle_interval),
            ("polling.db32_interval", self.db32_interval),
            ("polling.status_interval", self.status_interval),
            ("polling.reconnect_backoff_initial", self.reconnect_backoff_initial),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if self.reconnect_backoff_max < self.reconnect_backoff_initial {
            return Err(ConfigError::invalid(
                "polling.reconnect_backoff_max",
                "must not be shorter than the initial backoff",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::invalid(
                "polling.history_capacity",
                "must hold at least one entry",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Memory,
    Influx,
    Disabled,
}

/// Time-series persistence settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub backend: HistoryBackend,
    #[serde(default = "default_history_url")]
    pub url: String,
    #[serde(default = "default_history_org")]
    pub org: String,
    #[serde(default = "default_history_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_history_measurement")]
    pub measurement: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::default(),
            url: default_history_url(),
            org: default_history_org(),
            bucket: default_history_bucket(),
            token: None,
            measurement: default_history_measurement(),
            queue_capacity: default_queue_capacity(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl HistoryConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "history.queue_capacity",
                "must be positive",
            ));
        }
        if self.backend == HistoryBackend::Influx {
            if self.url.trim().is_empty() {
                return Err(ConfigError::invalid("history.url", "required for influx"));
            }
            if self.bucket.trim().is_empty() || self.org.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "history.bucket/history.org",
                    "required for influx",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveStoreConfig {
    #[serde(default = "default_valve_path")]
    pub path: PathBuf,
}

impl Default for ValveStoreConfig {
    fn default() -> Self {
        Self {
            path: default_valve_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            random_seed: default_simulation_seed(),
        }
    }
}
