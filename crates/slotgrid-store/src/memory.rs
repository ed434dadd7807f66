//! MemoryStore — in-process coordination store.
//!
//! A single mutex guards the key map, the bounded event history, and the
//! watcher list, which makes every operation linearizable and keeps the
//! change feed gap-free between replay and live delivery. TTLs are
//! enforced lazily on every operation and proactively by a sweeper task
//! so that `Expired` events fire even when nobody touches the key.
//!
//! Fault hooks (`set_available`, `sever_watches`) let tests and the chaos
//! demo simulate outages and dropped watch connections.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{key_matches, CoordinationStore, Watch};
use crate::types::{Action, Cursor, WatchEvent};

/// Tuning knobs for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Number of events retained for cursor replay.
    pub history_limit: usize,
    /// How often the sweeper looks for expired keys.
    pub sweep_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            sweep_interval: Duration::from_millis(50),
        }
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

struct KeySpace {
    entries: BTreeMap<String, Entry>,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    /// Highest cursor that has been dropped from `history`.
    compacted_through: Cursor,
    next_cursor: Cursor,
    watchers: Vec<Watcher>,
}

impl KeySpace {
    fn new(history_limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            compacted_through: 0,
            next_cursor: 1,
            watchers: Vec::new(),
        }
    }

    /// Append an event to the feed and fan it out to matching watchers.
    fn record(&mut self, action: Action, key: &str) {
        let event = WatchEvent {
            cursor: self.next_cursor,
            action,
            key: key.to_string(),
        };
        self.next_cursor += 1;

        // Closed receivers are pruned here.
        self.watchers.retain(|w| {
            if !key_matches(&w.prefix, &event.key) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });

        self.history.push_back(event);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted_through = dropped.cursor;
            }
        }
    }

    /// Remove every entry whose deadline has passed. Returns how many.
    fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &due {
            self.entries.remove(key);
            self.record(Action::Expired, key);
        }
        due.len()
    }
}

struct Inner {
    keys: Mutex<KeySpace>,
    available: AtomicBool,
}

impl Inner {
    /// Lock the key space after applying pending expirations.
    fn lock(&self) -> StoreResult<parking_lot::MutexGuard<'_, KeySpace>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        let mut keys = self.keys.lock();
        keys.expire_due(Instant::now());
        Ok(keys)
    }
}

/// Thread-safe in-memory coordination store.
///
/// Cloning yields another handle to the same key space.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create a store with default settings.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store with explicit settings.
    ///
    /// When called inside a Tokio runtime a sweeper task is spawned; it
    /// exits once the last handle is dropped. Outside a runtime TTLs are
    /// still honoured lazily.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        let inner = Arc::new(Inner {
            keys: Mutex::new(KeySpace::new(config.history_limit)),
            available: AtomicBool::new(true),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(run_sweeper(Arc::downgrade(&inner), config.sweep_interval));
        }

        debug!(history_limit = config.history_limit, "memory store opened");
        Self { inner }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    ///
    /// Expiry keeps running while unavailable, as it would server-side.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        debug!(available, "memory store availability changed");
    }

    /// Close every live watch, as if the connection had dropped.
    pub fn sever_watches(&self) {
        let mut keys = self.inner.keys.lock();
        let severed = keys.watchers.len();
        keys.watchers.clear();
        debug!(severed, "watches severed");
    }

    /// Number of live watch subscriptions.
    pub fn watcher_count(&self) -> usize {
        let mut keys = self.inner.keys.lock();
        keys.watchers.retain(|w| !w.tx.is_closed());
        keys.watchers.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_sweeper(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let expired = inner.keys.lock().expire_due(Instant::now());
        if expired > 0 {
            debug!(expired, "expired keys swept");
        }
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut keys = self.inner.lock()?;
        if keys.entries.contains_key(key) {
            return Ok(false);
        }
        keys.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(ttl),
            },
        );
        keys.record(Action::Created, key);
        Ok(true)
    }

    async fn refresh(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut keys = self.inner.lock()?;
        let existed = keys
            .entries
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: deadline(ttl),
                },
            )
            .is_some();
        let action = if existed { Action::Set } else { Action::Created };
        keys.record(action, key);
        Ok(())
    }

    async fn renew(&self, key: &str, expected: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut keys = self.inner.lock()?;
        match keys.entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = deadline(ttl);
            }
            _ => return Ok(false),
        }
        keys.record(Action::Set, key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut keys = self.inner.lock()?;
        if keys.entries.remove(key).is_none() {
            return Ok(false);
        }
        keys.record(Action::Deleted, key);
        Ok(true)
    }

    async fn delete_if(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut keys = self.inner.lock()?;
        if !keys.entries.get(key).is_some_and(|e| e.value == expected) {
            return Ok(false);
        }
        keys.entries.remove(key);
        keys.record(Action::Deleted, key);
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let keys = self.inner.lock()?;
        Ok(keys.entries.get(key).map(|e| e.value.clone()))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let keys = self.inner.lock()?;
        Ok(keys
            .entries
            .iter()
            .filter(|(k, _)| key_matches(prefix, k))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str, from: Option<Cursor>) -> StoreResult<Watch> {
        let mut keys = self.inner.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(from) = from {
            if from <= keys.compacted_through {
                return Err(StoreError::CursorCompacted {
                    requested: from,
                    oldest: keys.compacted_through + 1,
                });
            }
            for event in keys
                .history
                .iter()
                .filter(|e| e.cursor >= from && key_matches(prefix, &e.key))
            {
                // The receiver is still in scope, so this cannot fail.
                let _ = tx.send(event.clone());
            }
        }

        keys.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(Watch::new(rx))
    }

    async fn current_cursor(&self) -> StoreResult<Cursor> {
        let keys = self.inner.lock()?;
        Ok(keys.next_cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_secs(2);

    async fn next_event(watch: &mut Watch) -> WatchEvent {
        tokio::time::timeout(TICK, watch.next())
            .await
            .expect("timed out waiting for event")
            .unwrap()
    }

    #[tokio::test]
    async fn create_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.create_if_absent("/apps/a/0", "x", None).await.unwrap());
        assert!(!store.create_if_absent("/apps/a/0", "y", None).await.unwrap());
        assert_eq!(store.get("/apps/a/0").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn refresh_overwrites_unconditionally() {
        let store = MemoryStore::new();
        store.refresh("/apps/a/0", "x", None).await.unwrap();
        store.refresh("/apps/a/0", "y", None).await.unwrap();
        assert_eq!(store.get("/apps/a/0").await.unwrap().as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn renew_requires_matching_value() {
        let store = MemoryStore::new();
        assert!(!store.renew("/apps/a/0", "x", None).await.unwrap());

        store.create_if_absent("/apps/a/0", "x", None).await.unwrap();
        assert!(store.renew("/apps/a/0", "x", None).await.unwrap());
        assert!(!store.renew("/apps/a/0", "other", None).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.create_if_absent("/apps/a/0", "x", None).await.unwrap();
        assert!(store.delete("/apps/a/0").await.unwrap());
        assert!(!store.delete("/apps/a/0").await.unwrap());
        assert!(store.get("/apps/a/0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_if_requires_matching_value() {
        let store = MemoryStore::new();
        assert!(!store.delete_if("/apps/a/0", "x").await.unwrap());

        store.create_if_absent("/apps/a/0", "x", None).await.unwrap();
        let mut watch = store.watch("/apps/a/0", None).await.unwrap();

        assert!(!store.delete_if("/apps/a/0", "other").await.unwrap());
        assert_eq!(store.get("/apps/a/0").await.unwrap().as_deref(), Some("x"));

        assert!(store.delete_if("/apps/a/0", "x").await.unwrap());
        assert!(store.get("/apps/a/0").await.unwrap().is_none());
        assert_eq!(next_event(&mut watch).await.action, Action::Deleted);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryStore::new();
        store.create_if_absent("/apps/a/0", "x", None).await.unwrap();
        store.create_if_absent("/apps/a/1", "x", None).await.unwrap();
        store.create_if_absent("/apps/ab/0", "x", None).await.unwrap();

        let entries = store.list("/apps/a").await.unwrap();
        let keys: Vec<_> = entries.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["/apps/a/0", "/apps/a/1"]);
    }

    #[tokio::test]
    async fn ttl_expiry_emits_event() {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let mut watch = store.watch("/apps", None).await.unwrap();

        store
            .create_if_absent("/apps/a/0", "x", Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(next_event(&mut watch).await.action, Action::Created);
        let expired = next_event(&mut watch).await;
        assert_eq!(expired.action, Action::Expired);
        assert_eq!(expired.key, "/apps/a/0");
        assert!(store.get("/apps/a/0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn renew_extends_lease() {
        let store = MemoryStore::new();
        let ttl = Some(Duration::from_millis(150));
        store.create_if_absent("/apps/a/0", "x", ttl).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(store.renew("/apps/a/0", "x", ttl).await.unwrap());
        }
        assert!(store.get("/apps/a/0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn watch_only_sees_matching_keys() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/apps/a/1", None).await.unwrap();

        store.create_if_absent("/apps/a/10", "x", None).await.unwrap();
        store.create_if_absent("/apps/a/1", "x", None).await.unwrap();

        let event = next_event(&mut watch).await;
        assert_eq!(event.key, "/apps/a/1");
        assert_eq!(event.action, Action::Created);
    }

    #[tokio::test]
    async fn watch_replays_from_cursor() {
        let store = MemoryStore::new();
        let start = store.current_cursor().await.unwrap();
        store.create_if_absent("/apps/a/0", "x", None).await.unwrap();
        store.delete("/apps/a/0").await.unwrap();

        let mut watch = store.watch("/apps", Some(start)).await.unwrap();
        let created = next_event(&mut watch).await;
        let deleted = next_event(&mut watch).await;
        assert_eq!(created.cursor, start);
        assert_eq!(deleted.action, Action::Deleted);
        assert_eq!(deleted.cursor, start + 1);
    }

    #[tokio::test]
    async fn compacted_cursor_is_reported() {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            history_limit: 2,
            ..Default::default()
        });
        for i in 0..5 {
            store
                .create_if_absent(&format!("/apps/a/{i}"), "x", None)
                .await
                .unwrap();
        }

        let err = store.watch("/apps", Some(1)).await.unwrap_err();
        match err {
            StoreError::CursorCompacted { requested, oldest } => {
                assert_eq!(requested, 1);
                assert_eq!(oldest, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.watch("/apps", Some(4)).await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_store_fails_operations() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.create_if_absent("/apps/a/0", "x", None).await.unwrap_err();
        assert!(err.is_transient());

        store.set_available(true);
        assert!(store.create_if_absent("/apps/a/0", "x", None).await.unwrap());
    }

    #[tokio::test]
    async fn severed_watch_reports_closed() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/apps", None).await.unwrap();
        store.sever_watches();
        assert!(matches!(watch.next().await, Err(StoreError::WatchClosed)));
    }

    #[tokio::test]
    async fn dropped_watch_is_released() {
        let store = MemoryStore::new();
        let watch = store.watch("/apps", None).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        drop(watch);
        assert_eq!(store.watcher_count(), 0);
    }
}
