//! Domain types for the SlotGrid coordination store.
//!
//! Watch events describe changes to the key space; claim records are the
//! values written under a slot key by the node that owns it. Both are
//! JSON-serializable.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Monotonically increasing event number assigned by the store.
pub type Cursor = u64;

/// Unique identifier for a node in the fleet.
pub type NodeId = String;

// ── Watch events ───────────────────────────────────────────────────

/// What happened to a key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// The key did not exist and was written.
    Created,
    /// An existing key was overwritten or had its TTL renewed.
    Set,
    /// The key was removed explicitly.
    Deleted,
    /// The key's TTL lapsed without renewal.
    Expired,
}

impl Action {
    /// Whether the key no longer exists after this action.
    pub fn is_removal(self) -> bool {
        matches!(self, Action::Deleted | Action::Expired)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Set => "set",
            Action::Deleted => "deleted",
            Action::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A single entry of the store's change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub cursor: Cursor,
    pub action: Action,
    pub key: String,
}

// ── Claims ─────────────────────────────────────────────────────────

/// Value stored under a slot key while a node holds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotClaim {
    pub node_id: NodeId,
}

impl SlotClaim {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    /// Encode as the string value written to the store.
    pub fn encode(&self) -> StoreResult<String> {
        serde_json::to_string(self).map_err(|e| StoreError::Serialize(e.to_string()))
    }

    /// Decode a value read back from the store.
    pub fn decode(value: &str) -> StoreResult<Self> {
        serde_json::from_str(value).map_err(|e| StoreError::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_lowercase() {
        let json = serde_json::to_string(&Action::Expired).unwrap();
        assert_eq!(json, "\"expired\"");
        assert_eq!(Action::Deleted.to_string(), "deleted");
    }

    #[test]
    fn removal_actions() {
        assert!(Action::Deleted.is_removal());
        assert!(Action::Expired.is_removal());
        assert!(!Action::Created.is_removal());
        assert!(!Action::Set.is_removal());
    }

    #[test]
    fn claim_decode_rejects_garbage() {
        assert!(matches!(
            SlotClaim::decode("ok"),
            Err(StoreError::Deserialize(_))
        ));

        let claim = SlotClaim::decode(r#"{"node_id":"n-1"}"#).unwrap();
        assert_eq!(claim.node_id, "n-1");
    }
}
