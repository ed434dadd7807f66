//! Node error types.

use thiserror::Error;

/// Reasons a store key cannot be read back as a slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key {0:?} is not under the slot prefix")]
    MissingPrefix(String),

    #[error("key {0:?} is missing the app or index segment")]
    MissingSegment(String),

    #[error("key {0:?} has an empty app segment")]
    EmptyApp(String),

    #[error("key {key:?} has a non-numeric index {index:?}")]
    InvalidIndex { key: String, index: String },

    #[error("key {0:?} has segments past the index")]
    TrailingSegments(String),
}

/// Errors surfaced by node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("store error: {0}")]
    Store(#[from] slotgrid_store::StoreError),
}

pub type NodeResult<T> = Result<T, NodeError>;
