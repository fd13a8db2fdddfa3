//! Resolution cache.
//!
//! Entries live until [`ResolutionCache::clear`]; there is no eviction, so a
//! long-running process resolving many distinct keys grows without bound.
//! Concurrent first-time callers for the same key are not coalesced.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::request::ResolvedKey;

/// Process-lifetime map from [`ResolvedKey`] to a resolved value.
///
/// Cloning shares the underlying map, which is how two fetchers can share one
/// cache. A fresh cache is created with [`ResolutionCache::new`].
#[derive(Debug)]
pub struct ResolutionCache<V> {
    entries: Arc<DashMap<ResolvedKey, V>>,
}

impl<V: Clone> ResolutionCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn has(&self, key: &ResolvedKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &ResolvedKey) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn set(&self, key: ResolvedKey, value: V) {
        debug!("Caching {}", key);
        self.entries.insert(key, value);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<ResolvedKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<V: Clone> Default for ResolutionCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for ResolutionCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_clear() {
        let cache: ResolutionCache<String> = ResolutionCache::new();
        let key = ResolvedKey::package("left-pad", "1.3.0");

        assert!(!cache.has(&key));
        cache.set(key.clone(), "module.exports = 1".into());
        assert!(cache.has(&key));
        assert_eq!(cache.get(&key).as_deref(), Some("module.exports = 1"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn test_clones_share_entries() {
        let a: ResolutionCache<u32> = ResolutionCache::new();
        let b = a.clone();
        let independent: ResolutionCache<u32> = ResolutionCache::new();

        a.set(ResolvedKey::remote("https://x.test/a.js"), 7);
        assert_eq!(b.get(&ResolvedKey::remote("https://x.test/a.js")), Some(7));
        assert!(independent.is_empty());
        assert_eq!(b.keys(), vec![ResolvedKey::remote("https://x.test/a.js")]);
    }
}
