//! Read-mostly caches with double-checked insertion.

use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

/// A map probed under a read lock and filled under a write lock.
///
/// A miss escalates to the write lock and probes again before building, so
/// concurrent first access builds each entry exactly once. `build` runs with
/// the write lock held and must not touch the same cache.
pub struct CacheMap<K, V> {
    name: &'static str,
    entries: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash, V: Clone> CacheMap<K, V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> DbResult<Option<V>> {
        let entries = self.entries.read().map_err(|_| self.poisoned())?;
        Ok(entries.get(key).cloned())
    }

    pub fn get_or_try_insert<F>(&self, key: K, build: F) -> DbResult<V>
    where
        F: FnOnce() -> DbResult<V>,
    {
        if let Some(found) = self.get(&key)? {
            return Ok(found);
        }

        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        if let Some(found) = entries.get(&key) {
            return Ok(found.clone());
        }
        let value = build()?;
        entries.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned(&self) -> DbError {
        DbError::internal(format!("{} cache lock poisoned", self.name))
    }
}
