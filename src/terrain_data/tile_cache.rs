use bevy::log::debug;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error(
        "Unable to clean up quad tree cache. All tiles are in use. Increase maximum cache size."
    )]
    AllTilesInUse { resident: usize, bound: usize },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub resident_bytes: usize,
    pub entries: usize,
    pub pinned: usize,
    pub evictions: usize,
}

struct CacheEntry<V> {
    value: V,
    size: usize,
    timestamp: u64,
    in_use: bool,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    clock: u64,
    resident_bytes: usize,
    cleanup_count: usize,
    evictions: usize,
}

impl<V> CacheState<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.resident_bytes -= entry.size;
        Some(entry.value)
    }
}

/// A size bounded map of tiles, shared by all quadtrees of a [`TerrainContext`](super::quadtree::TerrainContext).
///
/// Whenever the resident size reaches the bound, a `put` evicts the least recently used entry
/// which is not marked as in use. Entries that are in use are never evicted.
pub struct TileCache<V> {
    bound: usize,
    max_cleanup_count: usize,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> TileCache<V> {
    pub const DEFAULT_BOUND: usize = 400_000_000;
    pub const DEFAULT_MAX_CLEANUP_COUNT: usize = 1000;

    pub fn new(bound: usize, max_cleanup_count: usize) -> Self {
        Self {
            bound,
            max_cleanup_count: max_cleanup_count.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
                resident_bytes: 0,
                cleanup_count: 0,
                evictions: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Returns the cached value and marks it as the most recently used entry.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.lock();
        let timestamp = state.tick();

        let entry = state.entries.get_mut(key)?;
        entry.timestamp = timestamp;
        Some(entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Inserts the value as the most recently used entry.
    ///
    /// If the cache is full afterwards, the oldest entry not in use is evicted and returned.
    /// Replacing an existing key keeps its in use flag.
    pub fn put(&self, key: impl Into<String>, value: V, size: usize) -> Result<Option<V>, CacheError> {
        let key = key.into();
        let mut state = self.lock();
        let timestamp = state.tick();
        let in_use = state.entries.get(&key).is_some_and(|entry| entry.in_use);

        let entry = CacheEntry {
            value,
            size,
            timestamp,
            in_use,
        };

        if let Some(previous) = state.entries.insert(key, entry) {
            state.resident_bytes -= previous.size;
        }
        state.resident_bytes += size;

        self.clean_up(&mut state)
    }

    /// Pins or unpins the entry. Returns false if the key is not cached.
    pub fn set_in_use(&self, key: &str, in_use: bool) -> bool {
        match self.lock().entries.get_mut(key) {
            Some(entry) => {
                entry.in_use = in_use;
                true
            }
            None => false,
        }
    }

    pub fn is_in_use(&self, key: &str) -> bool {
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.in_use)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().remove(key)
    }

    /// Removes every entry whose key starts with `prefix`, regardless of its in use flag.
    pub fn evict_by_prefix(&self, prefix: &str) -> Vec<V> {
        let mut state = self.lock();

        let keys = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect::<Vec<_>>();

        keys.iter().filter_map(|key| state.remove(key)).collect()
    }

    pub fn clear(&self) -> Vec<V> {
        let mut state = self.lock();

        state.resident_bytes = 0;
        state.cleanup_count = 0;
        state
            .entries
            .drain()
            .map(|(_, entry)| entry.value)
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();

        CacheStats {
            resident_bytes: state.resident_bytes,
            entries: state.entries.len(),
            pinned: state.entries.values().filter(|entry| entry.in_use).count(),
            evictions: state.evictions,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn clean_up(&self, state: &mut CacheState<V>) -> Result<Option<V>, CacheError> {
        if state.resident_bytes < self.bound {
            return Ok(None);
        }

        let oldest = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.in_use)
            .min_by_key(|(_, entry)| entry.timestamp)
            .map(|(key, _)| key.clone())
            .ok_or(CacheError::AllTilesInUse {
                resident: state.resident_bytes,
                bound: self.bound,
            })?;

        let value = state.remove(&oldest);

        state.evictions += 1;
        state.cleanup_count += 1;

        if state.cleanup_count >= self.max_cleanup_count {
            state.entries.shrink_to_fit();
            state.cleanup_count = 0;

            debug!(
                "Compacted the tile cache: {} entries, {} of {} bytes resident, {} evictions.",
                state.entries.len(),
                state.resident_bytes,
                self.bound,
                state.evictions
            );
        }

        Ok(value)
    }
}

impl<V: Clone> Default for TileCache<V> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BOUND, Self::DEFAULT_MAX_CLEANUP_COUNT)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{seq::IndexedRandom, Rng};

    #[test]
    fn evicts_the_oldest_entry() {
        let cache = TileCache::new(30, 10);

        assert_eq!(cache.put("a", 1, 10), Ok(None));
        assert_eq!(cache.put("b", 2, 10), Ok(None));

        // refresh a, so that b becomes the oldest entry
        assert_eq!(cache.get("a"), Some(1));

        assert_eq!(cache.put("c", 3, 10), Ok(Some(2)));
        assert!(!cache.contains("b"));
        assert_eq!(cache.stats().resident_bytes, 20);
    }

    #[test]
    fn entries_in_use_are_never_evicted() {
        let cache = TileCache::new(30, 10);

        cache.put("a", 1, 10).unwrap();
        assert!(cache.set_in_use("a", true));
        cache.put("b", 2, 10).unwrap();

        assert_eq!(cache.put("c", 3, 10), Ok(Some(2)));
        assert!(cache.contains("a"));
        assert_eq!(cache.stats().pinned, 1);
    }

    #[test]
    fn fails_if_every_entry_is_in_use() {
        let cache = TileCache::new(20, 10);

        cache.put("a", 1, 10).unwrap();
        assert!(cache.set_in_use("a", true));

        let error = cache.put("a", 1, 25).unwrap_err();

        assert_eq!(
            error,
            CacheError::AllTilesInUse {
                resident: 25,
                bound: 20
            }
        );
        assert_eq!(
            error.to_string(),
            "Unable to clean up quad tree cache. All tiles are in use. Increase maximum cache size."
        );
    }

    #[test]
    fn replacing_keeps_the_pin() {
        let cache = TileCache::new(100, 10);

        cache.put("a", 1, 10).unwrap();
        cache.set_in_use("a", true);
        cache.put("a", 2, 20).unwrap();

        assert!(cache.is_in_use("a"));
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.stats().resident_bytes, 20);
    }

    #[test]
    fn prefix_eviction() {
        let cache = TileCache::new(1000, 10);

        cache.put("0:/1", 1, 10).unwrap();
        cache.put("0:/1/2", 2, 10).unwrap();
        cache.put("1:/1", 3, 10).unwrap();
        cache.set_in_use("0:/1", true);

        let mut evicted = cache.evict_by_prefix("0:");
        evicted.sort();

        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().resident_bytes, 10);

        assert_eq!(cache.clear(), vec![3]);
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn compacts_after_the_cleanup_count() {
        let cache = TileCache::new(10, 2);

        for value in 0..5 {
            cache.put(value.to_string(), value, 10).unwrap();
        }

        assert_eq!(cache.stats().evictions, 5);
        assert_eq!(cache.lock().cleanup_count, 1);
    }

    #[test]
    fn random_puts_stay_within_the_bound() {
        const SIZE: usize = 10;
        const BOUND: usize = 200;

        let mut rng = rand::rng();
        let cache = TileCache::new(BOUND, 50);

        // keys ordered from least to most recently used
        let mut recency: Vec<String> = Vec::new();
        let mut pinned: Vec<String> = Vec::new();

        for _ in 0..2000 {
            let key = format!("/{}", rng.random_range(0..64));

            if rng.random_bool(0.2) {
                if cache.get(&key).is_some() {
                    recency.retain(|k| k != &key);
                    recency.push(key);
                }
                continue;
            }

            if rng.random_bool(0.02) && pinned.len() < 5 && cache.contains(&key) {
                cache.set_in_use(&key, true);
                pinned.push(key);
                continue;
            }

            if rng.random_bool(0.02) {
                if let Some(key) = pinned.choose(&mut rng).cloned() {
                    cache.set_in_use(&key, false);
                    pinned.retain(|k| k != &key);
                }
            }

            recency.retain(|k| k != &key);
            recency.push(key.clone());

            let grows = !cache.contains(&key);
            let expected = if cache.stats().resident_bytes + SIZE * grows as usize >= BOUND {
                recency.iter().find(|k| !pinned.contains(k)).cloned()
            } else {
                None
            };

            let evicted = cache.put(key, 0, SIZE).unwrap();

            assert_eq!(evicted.is_some(), expected.is_some());
            if let Some(expected) = expected {
                assert!(!cache.contains(&expected));
                recency.retain(|k| k != &expected);
            }

            assert!(cache.stats().resident_bytes < BOUND);
        }
    }
}
