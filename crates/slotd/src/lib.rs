//! slotd — the SlotGrid daemon.
//!
//! Wires the slotgrid crates into runnable fleets:
//! - `config`: slotd.toml parsing
//! - `ingress`: start requests over an in-process pub/sub bus
//! - `fleet`: node + starter + resurrector + listener per member
//! - `spam`: load generator

pub mod config;
pub mod fleet;
pub mod ingress;
pub mod spam;

pub use config::SlotdConfig;
pub use fleet::{Agent, Fleet, FleetConfig};
pub use ingress::{listen, LocalBus, StartRequest};
pub use spam::{spam, SpamConfig};
