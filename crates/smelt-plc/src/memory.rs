//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{PlcError, Result};
use crate::transport::{PlcTransport, TransportKind};

/// Return code a PLC uses for a data block that does not exist.
const CODE_OBJECT_MISSING: u8 = 0x0A;
/// Return code a PLC uses for an address outside a data block.
const CODE_OUT_OF_RANGE: u8 = 0x05;

/// A write observed by a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub db: u16,
    pub offset: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    blocks: HashMap<u16, Vec<u8>>,
    connected: bool,
    offline: bool,
    latency: Duration,
    reads: u64,
    connects: u64,
    writes: Vec<WriteRecord>,
}

/// In-memory data-block image behind the [`PlcTransport`] interface.
///
/// Clones share the same image, so a test can keep a handle to flip the
/// link offline or patch blocks while a connection owns another clone.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    kind: TransportKind,
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(TransportKind::Fieldbus)
    }
}

impl MemoryTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Replace the whole image of `db`.
    pub fn set_block(&self, db: u16, bytes: Vec<u8>) {
        self.state.lock().blocks.insert(db, bytes);
    }

    pub fn block(&self, db: u16) -> Option<Vec<u8>> {
        self.state.lock().blocks.get(&db).cloned()
    }

    /// Simulate a link loss. While offline, connects fail and any open
    /// session is dropped on its next request.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock();
        state.offline = offline;
        if offline {
            state.connected = false;
        }
    }

    /// Delay applied to every read.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    pub fn connect_count(&self) -> u64 {
        self.state.lock().connects
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    fn check_link(state: &MemoryState) -> Result<()> {
        if state.offline || !state.connected {
            return Err(PlcError::Disconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl PlcTransport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(PlcError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory PLC offline",
            )));
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.connected && !state.offline
    }

    async fn read_area(&mut self, db: u16, offset: usize, size: usize) -> Result<Vec<u8>> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        Self::check_link(&state)?;
        state.reads += 1;
        let block = state.blocks.get(&db).ok_or(PlcError::AccessDenied {
            db,
            offset,
            code: CODE_OBJECT_MISSING,
        })?;
        block
            .get(offset..offset + size)
            .map(<[u8]>::to_vec)
            .ok_or(PlcError::AccessDenied {
                db,
                offset,
                code: CODE_OUT_OF_RANGE,
            })
    }

    async fn write_area(&mut self, db: u16, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_link(&state)?;
        let block = state.blocks.get_mut(&db).ok_or(PlcError::AccessDenied {
            db,
            offset,
            code: CODE_OBJECT_MISSING,
        })?;
        let target = block
            .get_mut(offset..offset + data.len())
            .ok_or(PlcError::AccessDenied {
                db,
                offset,
                code: CODE_OUT_OF_RANGE,
            })?;
        target.copy_from_slice(data);
        state.writes.push(WriteRecord {
            db,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().connected = false;
    }
}
