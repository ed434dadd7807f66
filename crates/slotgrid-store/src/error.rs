//! Error types for the SlotGrid coordination store.

use thiserror::Error;

use crate::types::Cursor;

/// Result type alias for coordination store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("watch stream closed")]
    WatchClosed,

    #[error("cursor {requested} has been compacted; oldest retained event is {oldest}")]
    CursorCompacted { requested: Cursor, oldest: Cursor },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::WatchClosed)
    }
}
