//! Lazily populated per-route state.
//!
//! A [`Registry`] is owned by one orchestrator instance; separate instances never share entries.
//! The map lock is held only to look up or insert an `Arc`; each entry carries its own lock, so
//! callers on different routes never contend once their entries exist.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Keyed collection of shared per-route state, created on first use.
pub struct Registry<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("keys", &self.keys()).finish()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `key`, creating it with `make` on first use.
    pub fn get_or_insert_with(&self, key: &str, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.get(key) {
            return existing;
        }
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string()).or_insert_with(|| Arc::new(make())).clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<T>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys sorted lexicographically.
    pub fn keys(&self) -> Vec<String> {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Entries sorted by key.
    pub fn entries(&self) -> Vec<(String, Arc<T>)> {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, Arc<T>)> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
