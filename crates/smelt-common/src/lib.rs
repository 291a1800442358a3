//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the furnace acquisition core."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the smelting furnace acquisition workspace.
//! This crate exposes configuration loading, logging bootstrap, local-time
//! helpers and the typed snapshot model consumed across the workspace.

pub mod config;
pub mod logging;
pub mod model;
pub mod time;

pub use config::{
    AppConfig, ConfigError, HistoryBackend, HistoryConfig, LoggingConfig, MetricsConfig,
    PlcConfig, PollingSettings, SimulationConfig, ValveStoreConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use model::{
    ArcSnapshot, BatchStatus, CoolingWater, DeviceStatus, DustCollector, ElectrodeDepth,
    ElectrodeDepths, EmergencyStop, FeedingRecord, HopperReading, HopperState, Phase, PhaseValues,
    PollingSpeed, SensorSnapshot, StatusSnapshot, ValveConfig, ValveOpenness, ValveSettings,
    ValveStatus, VALVE_COUNT,
};
