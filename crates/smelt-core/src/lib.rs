//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Acquisition runtime for the smelting furnace."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Runtime of the furnace acquisition core: the polling loops, the polling
//! speed setting, batch lifecycle hooks, the display bridge and the bootstrap
//! that wires them to the PLC link, cache and history.

pub mod batch;
pub mod bridge;
pub mod loops;
pub mod polling_config;
pub mod processor;
pub mod scheduling;
pub mod service;
pub mod valves;

pub use batch::{BatchError, BatchService};
pub use bridge::{BridgeEvent, DataBridge};
pub use loops::{LoopDeps, LoopName, LoopState, PollingLoops, PollingLoopsStatus};
pub use polling_config::{PollingConfig, UnknownSpeed};
pub use scheduling::{Backoff, RateLimiter};
pub use service::FurnaceService;
pub use valves::ValveStore;
