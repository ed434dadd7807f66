//! slotgrid-starter — per-app start pipelines for SlotGrid.
//!
//! Start requests for the same app are funnelled through a dedicated
//! pipeline so that at most one placement per app is in flight on this
//! node, in the order requests were accepted.
//!
//! # Architecture
//!
//! ```text
//! StartSink::start(app, index)
//!   │
//!   ▼
//! Starter ── PipelineTable (one lock: create / lookup / retire)
//!   │
//!   ├── app "foo" → mpsc(1) → dispatcher → Placer::place (one at a time)
//!   └── app "bar" → mpsc(1) → dispatcher → Placer::place
//! ```
//!
//! Dispatchers retire after `idle_timeout` without traffic.

pub mod placer;
pub mod starter;

pub use placer::{Placer, StartSink};
pub use starter::{Starter, StarterConfig};
