//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Configuration loading tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use smelt_common::config::{AppConfig, ConfigError, HistoryBackend};
use smelt_common::PollingSpeed;
use tempfile::NamedTempFile;

#[test]
fn parses_full_configuration() {
    let config = AppConfig::from_str(
        r#"
        [plc]
        address = "192.168.0.10"
        rack = 0
        slot = 2
        io_timeout = 800

        [polling]
        speed = "0.2s"
        idle_interval = 5000
        db32_interval = 500

        [history]
        backend = "influx"
        url = "http://influx:8086"
        org = "plant"
        bucket = "furnace"
        token = "secret"
        "#,
    )
    .unwrap();

    assert_eq!(config.plc.endpoint(), "192.168.0.10:102");
    assert_eq!(config.plc.slot, 2);
    assert_eq!(config.plc.io_timeout, Duration::from_millis(800));
    assert_eq!(config.polling.speed, PollingSpeed::Fast);
    assert_eq!(config.polling.status_interval, Duration::from_secs(5));
    assert_eq!(config.history.backend, HistoryBackend::Influx);
    assert_eq!(config.history.token.as_deref(), Some("secret"));
}

#[test]
fn missing_address_is_fatal_outside_mock_mode() {
    let config = AppConfig::default();
    assert_eq!(config.validate(), Err(ConfigError::MissingPlcAddress));

    let mock = AppConfig::from_str("[plc]\nmock = true\n").unwrap();
    assert!(mock.plc.mock);
    assert!(mock.validate().is_ok());
}

#[test]
fn rejects_zero_intervals() {
    let err = AppConfig::from_str("[plc]\nmock = true\n[polling]\ndb32_interval = 0\n")
        .unwrap_err();
    assert!(format!("{err:#}").contains("polling.db32_interval"));
}

#[test]
fn load_with_source_picks_first_existing_candidate() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[plc]\nmock = true").unwrap();
    let missing = std::path::PathBuf::from("/definitely/not/here.toml");
    let loaded = AppConfig::load_with_source(&[missing, file.path().to_path_buf()]).unwrap();
    assert_eq!(loaded.source, file.path());
    assert!(loaded.config.plc.mock);
}
