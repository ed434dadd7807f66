//! Instances and the slot-key codec.
//!
//! A slot is identified by `(app, index)` and lives in the store at
//! `/apps/{app}/{index}`. All key construction and parsing goes through
//! [`encode_slot_key`] / [`decode_slot_key`].

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Root of the slot namespace in the coordination store.
pub const SLOT_PREFIX: &str = "/apps";

/// Build the store key for a slot.
pub fn encode_slot_key(app: &str, index: u32) -> String {
    format!("{SLOT_PREFIX}/{app}/{index}")
}

/// Parse a store key back into `(app, index)`.
pub fn decode_slot_key(key: &str) -> Result<(String, u32), KeyError> {
    let rest = key
        .strip_prefix(SLOT_PREFIX)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| KeyError::MissingPrefix(key.to_string()))?;

    let mut segments = rest.split('/');
    let app = segments.next().unwrap_or_default();
    let index = segments
        .next()
        .ok_or_else(|| KeyError::MissingSegment(key.to_string()))?;

    if segments.next().is_some() {
        return Err(KeyError::TrailingSegments(key.to_string()));
    }
    if app.is_empty() {
        return Err(KeyError::EmptyApp(key.to_string()));
    }
    if index.is_empty() {
        return Err(KeyError::MissingSegment(key.to_string()));
    }

    let index = index.parse::<u32>().map_err(|_| KeyError::InvalidIndex {
        key: key.to_string(),
        index: index.to_string(),
    })?;

    Ok((app.to_string(), index))
}

/// A workload slot.
///
/// Equality and hashing only look at `(app, index)`; `marked_for_death`
/// is local bookkeeping for the fault-injection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub app: String,
    pub index: u32,
    #[serde(default)]
    pub marked_for_death: bool,
}

impl Instance {
    pub fn new(app: impl Into<String>, index: u32) -> Self {
        Self {
            app: app.into(),
            index,
            marked_for_death: false,
        }
    }

    /// Rebuild an instance from a slot key.
    pub fn from_store_key(key: &str) -> Result<Self, KeyError> {
        let (app, index) = decode_slot_key(key)?;
        Ok(Self::new(app, index))
    }

    pub fn store_key(&self) -> String {
        encode_slot_key(&self.app, self.index)
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.app == other.app && self.index == other.index
    }
}

impl Eq for Instance {}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.app.hash(state);
        self.index.hash(state);
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_layout() {
        assert_eq!(encode_slot_key("app1", 3), "/apps/app1/3");
        assert_eq!(Instance::new("foo", 0).store_key(), "/apps/foo/0");
    }

    #[test]
    fn decode_valid_key() {
        assert_eq!(decode_slot_key("/apps/app1/3").unwrap(), ("app1".to_string(), 3));
        let inst = Instance::from_store_key("/apps/foo/42").unwrap();
        assert_eq!(inst, Instance::new("foo", 42));
    }

    #[test]
    fn decode_rejects_malformed_keys() {
        assert!(matches!(
            decode_slot_key("/nodes/app1/3"),
            Err(KeyError::MissingPrefix(_))
        ));
        assert!(matches!(
            decode_slot_key("/appsx/app1/3"),
            Err(KeyError::MissingPrefix(_))
        ));
        assert!(matches!(
            decode_slot_key("/apps/app1"),
            Err(KeyError::MissingSegment(_))
        ));
        assert!(matches!(
            decode_slot_key("/apps/app1/"),
            Err(KeyError::MissingSegment(_))
        ));
        assert!(matches!(
            decode_slot_key("/apps//3"),
            Err(KeyError::EmptyApp(_))
        ));
        assert!(matches!(
            decode_slot_key("/apps/app1/three"),
            Err(KeyError::InvalidIndex { .. })
        ));
        assert!(matches!(
            decode_slot_key("/apps/app1/-1"),
            Err(KeyError::InvalidIndex { .. })
        ));
        assert!(matches!(
            decode_slot_key("/apps/app1/3/extra"),
            Err(KeyError::TrailingSegments(_))
        ));
    }

    #[test]
    fn equality_ignores_death_mark() {
        let mut doomed = Instance::new("foo", 1);
        doomed.marked_for_death = true;
        assert_eq!(doomed, Instance::new("foo", 1));
        assert_ne!(doomed, Instance::new("foo", 2));
        assert_ne!(doomed, Instance::new("bar", 1));
    }
}
