//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Which kind of link sits behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Real fieldbus session with the furnace PLC.
    Fieldbus,
    /// In-process simulated furnace.
    Simulated,
}

/// Byte-level access to PLC data blocks.
///
/// Implementations are driven by [`crate::PlcConnection`], which serialises
/// calls and applies the I/O timeout, so a transport never sees two requests
/// in flight at once.
#[async_trait]
pub trait PlcTransport: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Open the session. Calling it on an open session is a no-op.
    async fn connect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Read `size` bytes of `db` starting at `offset`.
    async fn read_area(&mut self, db: u16, offset: usize, size: usize) -> Result<Vec<u8>>;

    /// Write `data` into `db` starting at `offset`.
    async fn write_area(&mut self, db: u16, offset: usize, data: &[u8]) -> Result<()>;

    async fn disconnect(&mut self);
}
