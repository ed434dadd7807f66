//! slotgrid-store — coordination store for SlotGrid.
//!
//! Slot ownership is decided by a shared key space with three properties:
//! atomic create-if-absent (the claim), TTL leases (failure detection),
//! and an ordered change feed (resurrection). This crate defines that
//! contract as the [`CoordinationStore`] trait and ships [`MemoryStore`],
//! an in-process implementation used for single-process fleets and tests.
//!
//! # Architecture
//!
//! ```text
//! CoordinationStore (trait)
//!   ├── create_if_absent / refresh / renew / delete   (writes)
//!   ├── get / list / current_cursor                   (reads)
//!   └── watch(prefix, from) → Watch                   (change feed)
//!
//! MemoryStore
//!   ├── BTreeMap<key, Entry{value, deadline}>
//!   ├── bounded event history (cursor replay)
//!   └── sweeper task (emits Expired events)
//! ```

pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, MemoryStoreConfig};
pub use store::{key_matches, CoordinationStore, Watch};
pub use types::*;
