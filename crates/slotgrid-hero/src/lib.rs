//! slotgrid-hero — self-healing for SlotGrid.
//!
//! The [`Resurrector`] closes the placement loop: whenever a slot key
//! disappears from the store (explicit stop, lease expiry, or outside
//! interference) it feeds a fresh start request for that slot back into
//! the starter.
//!
//! ```text
//! store change feed ──(deleted / expired)──▶ decode_slot_key
//!                                               │
//!                                               ▼
//!                                      StartSink::start(app, index)
//! ```

pub mod resurrector;

pub use resurrector::{Resurrector, ResurrectorConfig};
