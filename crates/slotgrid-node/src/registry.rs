//! Registry — node-local cache of the slots this node believes it owns.
//!
//! The store is authoritative; the registry is an optimistic view that may
//! lag behind until the next heartbeat corrects it. Every read returns an
//! owned snapshot, so callers can iterate while other tasks mutate.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::instance::Instance;

/// Concurrency-safe map of `app → index → Instance`.
#[derive(Debug, Default)]
pub struct Registry {
    apps: RwLock<HashMap<String, HashMap<u32, Instance>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an instance by `(app, index)`.
    pub fn register(&self, instance: Instance) {
        let mut apps = self.apps.write();
        apps.entry(instance.app.clone())
            .or_default()
            .insert(instance.index, instance);
    }

    /// Remove an instance. No-op if absent. Returns whether it was present.
    pub fn unregister(&self, app: &str, index: u32) -> bool {
        let mut apps = self.apps.write();
        let Some(indices) = apps.get_mut(app) else {
            return false;
        };
        let removed = indices.remove(&index).is_some();
        if indices.is_empty() {
            apps.remove(app);
        }
        removed
    }

    pub fn contains(&self, app: &str, index: u32) -> bool {
        self.apps
            .read()
            .get(app)
            .is_some_and(|indices| indices.contains_key(&index))
    }

    /// Snapshot of every instance of `app`; empty if none.
    pub fn instances_of(&self, app: &str) -> Vec<Instance> {
        self.apps
            .read()
            .get(app)
            .map(|indices| indices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every instance across all apps.
    pub fn all_instances(&self) -> Vec<Instance> {
        self.apps
            .read()
            .values()
            .flat_map(|indices| indices.values().cloned())
            .collect()
    }

    /// Instance count per app, ordered by app name.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.apps
            .read()
            .iter()
            .map(|(app, indices)| (app.clone(), indices.len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.apps.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
