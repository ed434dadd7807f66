//! The coordination store interface.
//!
//! Slot ownership lives in a shared key space that supports atomic
//! create-if-absent, TTL leases, and an ordered change feed. Nodes,
//! starters, and resurrectors only ever see this trait, so a real
//! client and the in-process [`MemoryStore`](crate::MemoryStore) are
//! interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};
use crate::types::{Cursor, WatchEvent};

/// Lease-aware, watchable key-value store.
///
/// A `ttl` of `None` writes a key that never expires.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically create `key` if it does not exist.
    ///
    /// Returns `Ok(false)` without modifying anything when the key is
    /// already present.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Unconditionally set `key`, replacing any value and TTL.
    async fn refresh(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Reset the TTL of `key` only if it currently holds `expected`.
    ///
    /// Returns `Ok(false)` when the key is gone or owned by someone else.
    async fn renew(&self, key: &str, expected: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remove `key` only if it currently holds `expected`.
    ///
    /// Returns `Ok(false)` when the key is gone or owned by someone else.
    async fn delete_if(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Read the current value of `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// List live entries at or below `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Subscribe to changes of `prefix` and everything below it.
    ///
    /// With `from = Some(c)` every retained event with cursor `>= c` is
    /// replayed first; with `None` only events after the call are seen.
    async fn watch(&self, prefix: &str, from: Option<Cursor>) -> StoreResult<Watch>;

    /// Cursor that the next event will carry.
    async fn current_cursor(&self) -> StoreResult<Cursor>;
}

/// Whether `key` is `prefix` itself or lives under it.
pub fn key_matches(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// A live change-feed subscription.
///
/// Dropping the `Watch` releases the subscription on the store side.
#[derive(Debug)]
pub struct Watch {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watch {
    /// Wrap the receiving half handed out by a store implementation.
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event.
    ///
    /// Returns [`StoreError::WatchClosed`] once the store side has gone
    /// away; callers are expected to resubscribe.
    pub async fn next(&mut self) -> StoreResult<WatchEvent> {
        self.rx.recv().await.ok_or(StoreError::WatchClosed)
    }
}
