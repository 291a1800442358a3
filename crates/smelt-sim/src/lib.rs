//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Synthetic furnace process data for mock mode."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Simulated furnace for mock mode.
//!
//! The generator produces raw block contents in the real register layout, so
//! the decoder, calculators, cache and history run unchanged against it.

pub mod generator;
pub mod plc;

pub use generator::{hopper_weight, valve_byte, FurnaceGenerator};
pub use plc::{SimulatedPlc, SIMULATED_UPPER_LIMIT_KG};
