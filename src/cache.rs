//! In-memory read-through caches in front of the stores.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Shared key/value cache.
///
/// Entries are only written after the backing store has committed, so a
/// cache hit never shows data the store does not have. The lock is held for
/// the map operation only and never across an `.await` or a store call.
#[derive(Clone)]
pub struct Cache<K, V> {
    entries: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for a key.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Insert or replace an entry.
    pub fn insert(&self, key: K, value: V) {
        self.entries.write().insert(key, value);
    }

    /// Drop an entry.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Return the cached value, or load it and cache the result.
    ///
    /// The loader runs without the lock held; two concurrent misses may both
    /// load, and the later insert wins.
    pub fn get_or_try_load<E>(
        &self,
        key: K,
        load: impl FnOnce(&K) -> Result<Option<V>, E>,
    ) -> Result<Option<V>, E> {
        if let Some(value) = self.get(&key) {
            return Ok(Some(value));
        }

        let loaded = load(&key)?;
        if let Some(value) = &loaded {
            self.insert(key, value.clone());
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_populates_only_on_hit() {
        let cache: Cache<i64, String> = Cache::new();

        let missing: Result<_, ()> = cache.get_or_try_load(1, |_| Ok(None));
        assert_eq!(missing, Ok(None));
        assert!(cache.is_empty());

        let loaded: Result<_, ()> = cache.get_or_try_load(2, |k| Ok(Some(format!("v{}", k))));
        assert_eq!(loaded, Ok(Some("v2".to_string())));
        assert_eq!(cache.get(&2).as_deref(), Some("v2"));

        // Cached values are returned without calling the loader.
        let cached: Result<_, ()> = cache.get_or_try_load(2, |_| Err(()));
        assert_eq!(cached, Ok(Some("v2".to_string())));
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let cache: Cache<i64, String> = Cache::new();
        let result: Result<Option<String>, &str> = cache.get_or_try_load(1, |_| Err("down"));
        assert_eq!(result, Err("down"));
        assert_eq!(cache.len(), 0);
    }
}
