//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Process-wide arc polling speed setting."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::str::FromStr;
use std::sync::Arc;

use smelt_common::PollingSpeed;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown polling speed {0:?}, expected \"0.2s\" or \"0.5s\"")]
pub struct UnknownSpeed(pub String);

/// Shared arc polling speed.
///
/// Cloning yields another handle on the same setting. Changes are delivered
/// through a watch channel, so readers see the latest value at their next tick
/// and callbacks run on their own task after the value is stored.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    tx: Arc<watch::Sender<PollingSpeed>>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::new(PollingSpeed::default())
    }
}

impl PollingConfig {
    pub fn new(initial: PollingSpeed) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get_polling_speed(&self) -> PollingSpeed {
        *self.tx.borrow()
    }

    /// Store `speed`. Returns true when the value actually changed.
    pub fn set_polling_speed(&self, speed: PollingSpeed) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == speed {
                false
            } else {
                *current = speed;
                true
            }
        });
        if changed {
            info!(%speed, "polling speed changed");
        }
        changed
    }

    /// Parse and store a speed given as `"0.2s"` or `"0.5s"`.
    pub fn set_polling_speed_str(&self, speed: &str) -> Result<bool, UnknownSpeed> {
        let parsed =
            PollingSpeed::from_str(speed.trim()).map_err(|_| UnknownSpeed(speed.to_owned()))?;
        Ok(self.set_polling_speed(parsed))
    }

    pub fn subscribe(&self) -> watch::Receiver<PollingSpeed> {
        self.tx.subscribe()
    }

    /// Invoke `callback` with each new speed on a spawned task.
    ///
    /// The task ends when every [`PollingConfig`] handle is dropped or when
    /// the returned handle is aborted.
    pub fn register_callback<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(PollingSpeed) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let speed = *rx.borrow_and_update();
                debug!(%speed, "polling speed callback");
                callback(speed);
            }
        })
    }
}
