//! Concurrent Cache Map
//!
//! Internally synchronized map from [`CacheKey`] to [`CacheEntry`]. Point
//! reads and writes never need an outer lock; the coordinator only ever
//! replaces whole maps, never clears one that readers may still hold.

use std::sync::Arc;

use dashmap::DashMap;

use super::entry::{CacheEntry, CacheKey};

/// Query cache map, sharded for concurrent point access
#[derive(Debug)]
pub struct CacheMap<Q> {
    entries: DashMap<CacheKey, Arc<CacheEntry<Q>>>,
}

impl<Q> Default for CacheMap<Q> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<Q> CacheMap<Q> {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an entry by key
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry<Q>>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Insert an entry under its own key, returning the entry it replaced
    pub fn insert(&self, entry: CacheEntry<Q>) -> Option<Arc<CacheEntry<Q>>> {
        self.insert_shared(Arc::new(entry))
    }

    /// Insert an already shared entry
    pub fn insert_shared(&self, entry: Arc<CacheEntry<Q>>) -> Option<Arc<CacheEntry<Q>>> {
        self.entries.insert(entry.key(), entry)
    }

    /// Remove an entry
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry<Q>>> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the keys currently present
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Snapshot of the entries currently present
    pub fn entries(&self) -> Vec<Arc<CacheEntry<Q>>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Copy every entry of `newer` into this map, overwriting on conflict.
    ///
    /// Returns the number of entries copied.
    pub fn merge_from(&self, newer: &CacheMap<Q>) -> usize {
        let mut merged = 0;
        for item in newer.entries.iter() {
            self.entries.insert(*item.key(), Arc::clone(item.value()));
            merged += 1;
        }
        merged
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(query: &str) -> CacheEntry<String> {
        CacheEntry::new(CacheKey::from_content(query), query.to_string())
    }

    #[test]
    fn test_insert_get_remove() {
        let map = CacheMap::new();
        assert!(map.is_empty());

        let e = entry("title:rust");
        let key = e.key();
        assert!(map.insert(e).is_none());

        assert!(map.contains(&key));
        assert_eq!(map.get(&key).unwrap().payload(), "title:rust");
        assert_eq!(map.len(), 1);

        assert!(map.remove(&key).is_some());
        assert!(map.get(&key).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_last_writer_wins() {
        let map = CacheMap::new();
        let key = CacheKey::from_content("same");

        map.insert(CacheEntry::new(key, "first".to_string()));
        let old = map.insert(CacheEntry::new(key, "second".to_string()));

        assert_eq!(old.unwrap().payload(), "first");
        assert_eq!(map.get(&key).unwrap().payload(), "second");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_merge_overwrites_with_newer() {
        let scanned = CacheMap::new();
        let overflow = CacheMap::new();
        let shared = CacheKey::from_content("shared");

        scanned.insert(CacheEntry::new(shared, "stale".to_string()));
        scanned.insert(entry("only-scanned"));
        overflow.insert(CacheEntry::new(shared, "fresh".to_string()));
        overflow.insert(entry("only-overflow"));

        let merged = scanned.merge_from(&overflow);

        assert_eq!(merged, 2);
        assert_eq!(scanned.len(), 3);
        assert_eq!(scanned.get(&shared).unwrap().payload(), "fresh");
        // Source map is left untouched
        assert_eq!(overflow.len(), 2);
    }

    #[test]
    fn test_held_entry_survives_removal() {
        let map = CacheMap::new();
        let e = entry("held");
        let key = e.key();
        map.insert(e);

        let held = map.get(&key).unwrap();
        map.remove(&key);

        assert_eq!(held.payload(), "held");
    }

    #[test]
    fn test_concurrent_point_writes() {
        let map = Arc::new(CacheMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.insert(entry(&format!("q-{}-{}", t, i)));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.len(), 800);
        assert_eq!(map.keys().len(), 800);
        assert_eq!(map.entries().len(), 800);
    }
}
