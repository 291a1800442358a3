//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the PLC crate.
pub type Result<T> = std::result::Result<T, PlcError>;

/// A raw block could not be turned into typed fields.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("DB{db}: {field} at offset {offset} needs {needed} bytes but the buffer holds {len}")]
    ShortBuffer {
        db: u16,
        field: &'static str,
        offset: usize,
        needed: usize,
        len: usize,
    },
    #[error("DB{db} has no decode schema")]
    UnknownBlock { db: u16 },
}

/// Failures talking to the PLC.
#[derive(Debug, Error)]
pub enum PlcError {
    #[error("not connected to PLC")]
    Disconnected,
    #[error("PLC {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("PLC io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PLC protocol error: {0}")]
    Protocol(String),
    #[error("PLC rejected access to DB{db} offset {offset} (return code {code:#04x})")]
    AccessDenied { db: u16, offset: usize, code: u8 },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("PLC configuration error: {0}")]
    Config(String),
}

impl PlcError {
    /// Whether the link must be torn down and re-established after this error.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            PlcError::Disconnected
                | PlcError::Timeout { .. }
                | PlcError::Io(_)
                | PlcError::Protocol(_)
        )
    }
}
