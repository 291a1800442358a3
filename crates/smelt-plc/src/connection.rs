//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Owner of the single PLC session shared by every polling loop and by the
//! write API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use smelt_common::PlcConfig;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PlcError, Result};
use crate::s7::S7Transport;
use crate::transport::{PlcTransport, TransportKind};

/// Counters describing the health of the PLC link.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub connects: u64,
    pub connect_failures: u64,
    pub disconnects: u64,
    pub reads: u64,
    pub read_failures: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Serialised access to one PLC transport.
///
/// All requests pass through an async mutex, so loops contend for the link
/// for at most one I/O timeout each. Connection faults drop the session and
/// flip [`PlcConnection::is_connected`] to false; the polling loops reconnect.
#[derive(Debug)]
pub struct PlcConnection {
    transport: Mutex<Box<dyn PlcTransport>>,
    kind: TransportKind,
    connected: AtomicBool,
    io_timeout: Duration,
    stats: parking_lot::Mutex<ConnectionStats>,
}

impl PlcConnection {
    pub fn new(transport: Box<dyn PlcTransport>, io_timeout: Duration) -> Self {
        let kind = transport.kind();
        Self {
            transport: Mutex::new(transport),
            kind,
            connected: AtomicBool::new(false),
            io_timeout,
            stats: parking_lot::Mutex::new(ConnectionStats::default()),
        }
    }

    /// Build a fieldbus connection for `config`.
    pub fn from_config(config: &PlcConfig) -> Self {
        Self::new(Box::new(S7Transport::from_config(config)), config.io_timeout)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_simulated(&self) -> bool {
        self.kind == TransportKind::Simulated
    }

    /// Open the session. Returns true if the link is up afterwards.
    pub async fn connect(&self) -> bool {
        let mut transport = self.transport.lock().await;
        if transport.is_connected() {
            self.connected.store(true, Ordering::Release);
            return true;
        }
        match transport.connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                let mut stats = self.stats.lock();
                stats.connects += 1;
                stats.last_connected_at = Some(Utc::now());
                info!(kind = ?self.kind, "PLC connected");
                true
            }
            Err(err) => {
                self.connected.store(false, Ordering::Release);
                let mut stats = self.stats.lock();
                stats.connect_failures += 1;
                stats.last_error = Some(err.to_string());
                warn!(error = %err, "PLC connect failed");
                false
            }
        }
    }

    /// Last known link state. Never blocks.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Read `size` bytes from `db` at `offset`.
    pub async fn read_db(&self, db: u16, offset: usize, size: usize) -> Result<Vec<u8>> {
        let mut transport = self.transport.lock().await;
        if !self.is_connected() || !transport.is_connected() {
            self.connected.store(false, Ordering::Release);
            return Err(PlcError::Disconnected);
        }
        let outcome = tokio::time::timeout(self.io_timeout, transport.read_area(db, offset, size))
            .await
            .unwrap_or(Err(PlcError::Timeout {
                operation: "read",
                timeout: self.io_timeout,
            }));
        match outcome {
            Ok(bytes) => {
                self.stats.lock().reads += 1;
                debug!(db, offset, size, "PLC read");
                Ok(bytes)
            }
            Err(err) => {
                {
                    let mut stats = self.stats.lock();
                    stats.read_failures += 1;
                    stats.last_error = Some(err.to_string());
                }
                if err.is_connection_fault() {
                    self.drop_session(transport.as_mut(), &err).await;
                }
                Err(err)
            }
        }
    }

    /// Write `data` into `db` at `offset`, reporting the failure reason.
    pub async fn try_write_db(&self, db: u16, offset: usize, data: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock().await;
        if !self.is_connected() || !transport.is_connected() {
            self.connected.store(false, Ordering::Release);
            return Err(PlcError::Disconnected);
        }
        let outcome = tokio::time::timeout(self.io_timeout, transport.write_area(db, offset, data))
            .await
            .unwrap_or(Err(PlcError::Timeout {
                operation: "write",
                timeout: self.io_timeout,
            }));
        match outcome {
            Ok(()) => {
                self.stats.lock().writes += 1;
                info!(db, offset, len = data.len(), "PLC write");
                Ok(())
            }
            Err(err) => {
                {
                    let mut stats = self.stats.lock();
                    stats.write_failures += 1;
                    stats.last_error = Some(err.to_string());
                }
                warn!(db, offset, error = %err, "PLC write failed");
                if err.is_connection_fault() {
                    self.drop_session(transport.as_mut(), &err).await;
                }
                Err(err)
            }
        }
    }

    /// Write `data` into `db` at `offset`. Failures are logged and reported as `false`.
    pub async fn write_db(&self, db: u16, offset: usize, data: &[u8]) -> bool {
        self.try_write_db(db, offset, data).await.is_ok()
    }

    pub async fn disconnect(&self) {
        let mut transport = self.transport.lock().await;
        if transport.is_connected() {
            transport.disconnect().await;
            self.stats.lock().disconnects += 1;
        }
        self.connected.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }

    async fn drop_session(&self, transport: &mut dyn PlcTransport, cause: &PlcError) {
        warn!(error = %cause, "PLC link fault, dropping session");
        transport.disconnect().await;
        self.connected.store(false, Ordering::Release);
        self.stats.lock().disconnects += 1;
    }
}
