//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Setpoint writes issued from the settings screen.
//!
//! Values are validated before any I/O. In simulated mode every write
//! succeeds with a `[Mock]` message and the transport is left untouched.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::connection::PlcConnection;
use crate::register_map::{db1, db18, DB_ARC, DB_HOPPER_LIMIT};

pub const HOPPER_LIMIT_MAX_KG: f64 = 10_000.0;
pub const ARC_LIMIT_MAX_A: i32 = 20_000;
pub const EMERGENCY_DELAY_MAX_MS: i32 = 10_000;

/// A setpoint outside its allowed range.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("hopper upper limit must be within (0, {max}] kg, got {value}")]
    HopperLimit { value: f64, max: f64 },
    #[error("arc limit must be within (0, {max}] A, got {value}")]
    ArcLimit { value: i32, max: i32 },
    #[error("emergency delay must be within [0, {max}] ms, got {value}")]
    EmergencyDelay { value: i32, max: i32 },
}

pub fn validate_hopper_limit(kg: f64) -> Result<i32, ValidationError> {
    if kg.is_nan() || kg <= 0.0 || kg > HOPPER_LIMIT_MAX_KG {
        return Err(ValidationError::HopperLimit {
            value: kg,
            max: HOPPER_LIMIT_MAX_KG,
        });
    }
    Ok(kg.round() as i32)
}

pub fn validate_arc_limit(amps: i32) -> Result<i16, ValidationError> {
    if amps <= 0 || amps > ARC_LIMIT_MAX_A {
        return Err(ValidationError::ArcLimit {
            value: amps,
            max: ARC_LIMIT_MAX_A,
        });
    }
    // DB1.182 is an INT; 20000 A still fits.
    Ok(amps as i16)
}

pub fn validate_emergency_delay(ms: i32) -> Result<i32, ValidationError> {
    if !(0..=EMERGENCY_DELAY_MAX_MS).contains(&ms) {
        return Err(ValidationError::EmergencyDelay {
            value: ms,
            max: EMERGENCY_DELAY_MAX_MS,
        });
    }
    Ok(ms)
}

/// UI-facing result of a write request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub success: bool,
    pub message: String,
}

impl WriteOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl From<ValidationError> for WriteOutcome {
    fn from(err: ValidationError) -> Self {
        WriteOutcome::failed(err.to_string())
    }
}

/// Validated setpoint writes through the shared PLC connection.
#[derive(Debug, Clone)]
pub struct PlcWriter {
    connection: Arc<PlcConnection>,
}

impl PlcWriter {
    pub fn new(connection: Arc<PlcConnection>) -> Self {
        Self { connection }
    }

    /// Issue `requests` in order, stopping at the first failure.
    async fn apply(&self, requests: &[WriteRequest], summary: String) -> WriteOutcome {
        if self.connection.is_simulated() {
            return WriteOutcome::ok(format!("[Mock] {summary}"));
        }
        if !self.connection.is_connected() && !self.connection.connect().await {
            warn!(%summary, "PLC write skipped, link down");
            return WriteOutcome::failed(format!("{}: PLC not connected", requests[0].label));
        }
        for (index, request) in requests.iter().enumerate() {
            if let Err(err) = self
                .connection
                .try_write_db(request.db, request.offset, &request.data)
                .await
            {
                warn!(label = request.label, completed = index, error = %err, "PLC write failed");
                return WriteOutcome::failed(format!("{}: {err}", request.label));
            }
        }
        info!(%summary, "PLC setpoints written");
        WriteOutcome::ok(summary)
    }

    pub async fn write_hopper_upper_limit_to_plc(&self, kg: f64) -> WriteOutcome {
        let value = match validate_hopper_limit(kg) {
            Ok(value) => value,
            Err(err) => return err.into(),
        };
        let request = WriteRequest::new(
            "hopper upper limit",
            DB_HOPPER_LIMIT,
            db18::UPPER_LIMIT,
            &value.to_be_bytes(),
        );
        self.apply(&[request], format!("hopper upper limit set to {value} kg"))
            .await
    }

    pub async fn write_arc_limit_to_plc(&self, amps: i32) -> WriteOutcome {
        let value = match validate_arc_limit(amps) {
            Ok(value) => value,
            Err(err) => return err.into(),
        };
        let request = WriteRequest::new("arc limit", DB_ARC, db1::ARC_LIMIT, &value.to_be_bytes());
        self.apply(&[request], format!("arc limit set to {value} A"))
            .await
    }

    pub async fn write_emergency_delay_to_plc(&self, ms: i32) -> WriteOutcome {
        let value = match validate_emergency_delay(ms) {
            Ok(value) => value,
            Err(err) => return err.into(),
        };
        let request = WriteRequest::new(
            "emergency delay",
            DB_ARC,
            db1::EMERGENCY_DELAY,
            &value.to_be_bytes(),
        );
        self.apply(&[request], format!("emergency delay set to {value} ms"))
            .await
    }

    /// Write arc limit and delay as two requests; 184..186 is reserved and must not be touched.
    pub async fn write_arc_limit_and_delay_to_plc(&self, amps: i32, ms: i32) -> WriteOutcome {
        let (limit, delay) = match (validate_arc_limit(amps), validate_emergency_delay(ms)) {
            (Ok(limit), Ok(delay)) => (limit, delay),
            (Err(err), _) | (_, Err(err)) => return err.into(),
        };
        let requests = [
            WriteRequest::new("arc limit", DB_ARC, db1::ARC_LIMIT, &limit.to_be_bytes()),
            WriteRequest::new(
                "emergency delay",
                DB_ARC,
                db1::EMERGENCY_DELAY,
                &delay.to_be_bytes(),
            ),
        ];
        self.apply(
            &requests,
            format!("arc limit set to {limit} A, emergency delay set to {delay} ms"),
        )
        .await
    }
}

struct WriteRequest {
    label: &'static str,
    db: u16,
    offset: usize,
    data: Vec<u8>,
}

impl WriteRequest {
    fn new(label: &'static str, db: u16, offset: usize, data: &[u8]) -> Self {
        Self {
            label,
            db,
            offset,
            data: data.to_vec(),
        }
    }
}
