//! slotgrid-node — slot claims and lease heartbeats for SlotGrid.
//!
//! A [`Node`] places instances by racing other nodes for the slot's store
//! key, keeps the slots it won alive with periodic lease renewals, and
//! tracks them in a local [`Registry`].
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── start_instance: hesitate (watch ⟂ timer) → create_if_absent → register
//!   ├── heartbeat loop: renew every registered slot, drop the lost ones
//!   ├── FaultPolicy (optional scheduled deaths)
//!   └── Registry (app → index → Instance)
//! ```

pub mod error;
pub mod fault;
pub mod hesitation;
pub mod instance;
pub mod node;
pub mod registry;

pub use error::{KeyError, NodeError, NodeResult};
pub use fault::{FaultPolicy, NeverFail, RandomFailure};
pub use hesitation::Hesitation;
pub use instance::{decode_slot_key, encode_slot_key, Instance, SLOT_PREFIX};
pub use node::{HeartbeatReport, Node, NodeConfig, Placement};
pub use registry::Registry;
