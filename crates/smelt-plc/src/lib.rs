//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "PLC connectivity and register decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fieldbus side of the furnace: data-block layout, decoding, transports and
//! the shared connection used by the polling loops and the write API.

pub mod connection;
pub mod decode;
pub mod error;
pub mod memory;
pub mod register_map;
pub mod s7;
pub mod transport;
pub mod writer;

pub use connection::{ConnectionStats, PlcConnection};
pub use decode::{
    decode_arc_block, decode_block, decode_device_block, decode_hopper_block,
    decode_sensor_block, decode_upper_limit, valve_bits, ArcRaw, HopperRaw, RegisterValue,
    SensorRaw, ValveBits,
};
pub use error::{DecodeError, PlcError, Result};
pub use memory::{MemoryTransport, WriteRecord};
pub use s7::S7Transport;
pub use transport::{PlcTransport, TransportKind};
pub use writer::{PlcWriter, ValidationError, WriteOutcome};
