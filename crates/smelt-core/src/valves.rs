//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted valve travel calibration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use smelt_common::ValveSettings;
use tracing::{debug, info, warn};

/// JSON file holding [`ValveSettings`].
#[derive(Debug, Clone)]
pub struct ValveStore {
    path: PathBuf,
}

impl ValveStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored calibration, or the defaults when no file exists yet.
    /// A file that exists but cannot be parsed is an error.
    pub fn load_or_default(&self) -> Result<ValveSettings> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no valve configuration stored, using defaults");
            return Ok(ValveSettings::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("unable to read valve config {}", self.path.display()))?;
        let settings: ValveSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse valve config {}", self.path.display()))?;
        for (index, valve) in settings.valves.iter().enumerate() {
            if !valve.is_valid() {
                warn!(valve_id = index + 1, ?valve, "stored valve calibration is not usable");
            }
        }
        debug!(path = %self.path.display(), "valve configuration loaded");
        Ok(settings)
    }

    pub fn save(&self, settings: &ValveSettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("unable to create directory {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, body)
            .with_context(|| format!("unable to write valve config {}", self.path.display()))?;
        debug!(path = %self.path.display(), "valve configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_common::ValveConfig;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_defaults_and_saves_round_trip() {
        let dir = tempdir().unwrap();
        let store = ValveStore::new(dir.path().join("nested").join("valves.json"));
        assert_eq!(store.load_or_default().unwrap(), ValveSettings::default());

        let mut settings = ValveSettings::default();
        *settings.get_mut(3).unwrap() = ValveConfig {
            full_open_time_s: 45.0,
            full_close_time_s: 40.0,
        };
        store.save(&settings).unwrap();
        assert_eq!(store.load_or_default().unwrap(), settings);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("valves.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(ValveStore::new(path).load_or_default().is_err());
    }
}
