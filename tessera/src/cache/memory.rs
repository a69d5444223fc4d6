//! Cost-bounded in-memory LRU cache.
//!
//! Entries carry a numeric cost (for images, the decoded byte size). The sum
//! of resident costs never exceeds `cost_limit` and the number of entries
//! never exceeds `count_limit`. Inserting past either bound evicts the least
//! recently used entries until the new entry fits. An entry whose cost alone
//! exceeds `cost_limit` is rejected and the cache is left unchanged.
//!
//! # Layout
//!
//! ```text
//! entries: HashMap<K, Entry>        key -> (value, cost, inserted_at, stamp)
//! order:   BTreeMap<stamp, K>       oldest stamp first
//! ```
//!
//! Every access moves the entry to a fresh stamp, so the first key in
//! `order` is always the eviction candidate. Both maps live behind a single
//! `parking_lot::Mutex`; eviction happens synchronously inside `set`.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::cache::CacheStats;
use crate::config::MemoryCacheConfig;

struct Entry<V> {
    value: V,
    cost: usize,
    inserted_at: Instant,
    stamp: u64,
}

struct State<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
    next_stamp: u64,
    total_cost: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K, V> State<K, V>
where
    K: Eq + Hash + Clone,
{
    fn bump(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        self.total_cost -= entry.cost;
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_cost -= entry.cost;
            self.evictions += 1;
        }
        true
    }
}

/// In-memory LRU cache bounded by total cost and entry count.
pub struct MemoryCache<K, V> {
    config: MemoryCacheConfig,
    state: Mutex<State<K, V>>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache with the given bounds.
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_stamp: 0,
                total_cost: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// Returns a clone of the cached value and marks it most recently used.
    ///
    /// Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => self
                .config
                .ttl
                .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl),
        };
        if expired {
            state.remove(key);
            state.misses += 1;
            return None;
        }

        let stamp = state.bump();
        let State { entries, order, .. } = &mut *state;
        let entry = entries.get_mut(key)?;
        order.remove(&entry.stamp);
        entry.stamp = stamp;
        order.insert(stamp, key.clone());
        let value = entry.value.clone();
        state.hits += 1;
        Some(value)
    }

    /// Stores `value` with the given cost, evicting LRU entries as needed.
    ///
    /// Returns false if the entry cannot fit at all; in that case nothing
    /// changes, including any existing entry under `key`.
    pub fn set(&self, key: K, value: V, cost: usize) -> bool {
        if cost > self.config.cost_limit || self.config.count_limit == 0 {
            trace!(
                cost,
                cost_limit = self.config.cost_limit,
                "Rejected oversized cache entry"
            );
            return false;
        }

        let mut state = self.state.lock();
        state.remove(&key);

        let stamp = state.bump();
        state.order.insert(stamp, key.clone());
        state.entries.insert(
            key,
            Entry {
                value,
                cost,
                inserted_at: Instant::now(),
                stamp,
            },
        );
        state.total_cost += cost;

        while state.total_cost > self.config.cost_limit
            || state.entries.len() > self.config.count_limit
        {
            if !state.evict_oldest() {
                break;
            }
        }
        true
    }

    /// Removes and returns an entry.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.state.lock().remove(key).map(|entry| entry.value)
    }

    /// Returns true if `key` is resident. Does not refresh recency.
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.total_cost = 0;
    }

    /// Sum of the costs of resident entries.
    pub fn total_cost(&self) -> usize {
        self.state.lock().total_cost
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns hit/miss/eviction counters and current occupancy.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            entry_count: state.entries.len(),
            total_cost: state.total_cost,
        }
    }
}

impl<K, V> std::fmt::Debug for MemoryCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryCache")
            .field("entries", &state.entries.len())
            .field("total_cost", &state.total_cost)
            .field("cost_limit", &self.config.cost_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn cache(cost_limit: usize) -> MemoryCache<u32, &'static str> {
        MemoryCache::new(MemoryCacheConfig::with_cost_limit(cost_limit))
    }

    #[test]
    fn test_set_and_get() {
        let cache = cache(100);
        assert!(cache.set(1, "a", 10));
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.total_cost(), 10);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_miss() {
        let cache = cache(100);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = cache(30);
        cache.set(1, "a", 10);
        cache.set(2, "b", 10);
        cache.set(3, "c", 10);

        // Touch 1 so 2 becomes the oldest.
        assert_eq!(cache.get(&1), Some("a"));
        cache.set(4, "d", 10);

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
        assert_eq!(cache.total_cost(), 30);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_large_entry_evicts_several() {
        let cache = cache(30);
        cache.set(1, "a", 10);
        cache.set(2, "b", 10);
        cache.set(3, "c", 10);
        cache.set(4, "d", 25);

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&4));
        assert_eq!(cache.total_cost(), 25);
    }

    #[test]
    fn test_oversized_entry_leaves_cache_unchanged() {
        let cache = cache(30);
        cache.set(1, "a", 10);
        cache.set(2, "b", 10);

        assert!(!cache.set(3, "c", 31));
        assert!(!cache.set(1, "replacement", 31));

        assert_eq!(cache.get(&1), Some("a"));
        assert!(cache.contains(&2));
        assert!(!cache.contains(&3));
        assert_eq!(cache.total_cost(), 20);
    }

    #[test]
    fn test_replace_updates_cost() {
        let cache = cache(100);
        cache.set(1, "a", 10);
        cache.set(1, "b", 40);
        assert_eq!(cache.get(&1), Some("b"));
        assert_eq!(cache.total_cost(), 40);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_count_limit() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            cost_limit: 1000,
            count_limit: 2,
            ttl: None,
        });
        cache.set(1, "a", 1);
        cache.set(2, "b", 1);
        cache.set(3, "c", 1);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            cost_limit: 1000,
            count_limit: 10,
            ttl: Some(Duration::from_millis(20)),
        });
        cache.set(1, "a", 5);
        assert_eq!(cache.get(&1), Some("a"));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = cache(100);
        cache.set(1, "a", 10);
        cache.set(2, "b", 10);

        assert_eq!(cache.remove(&1), Some("a"));
        assert_eq!(cache.remove(&1), None);
        assert_eq!(cache.total_cost(), 10);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_statistics() {
        let cache = cache(100);
        cache.set(1, "a", 10);
        cache.get(&1);
        cache.get(&1);
        cache.get(&2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_cost, 10);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(MemoryCache::<u32, u32>::new(
            MemoryCacheConfig::with_cost_limit(500),
        ));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = t * 1000 + i;
                        cache.set(key, i, 7);
                        cache.get(&key);
                        assert!(cache.total_cost() <= 500);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.total_cost() <= 500);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Set(u8, usize),
            Get(u8),
            Remove(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (any::<u8>(), 0usize..80).prop_map(|(k, c)| Op::Set(k % 16, c)),
                any::<u8>().prop_map(|k| Op::Get(k % 16)),
                any::<u8>().prop_map(|k| Op::Remove(k % 16)),
            ]
        }

        proptest! {
            #[test]
            fn test_cost_never_exceeds_limit(ops in proptest::collection::vec(op(), 1..200)) {
                let cache = MemoryCache::<u8, u8>::new(MemoryCacheConfig::with_cost_limit(64));
                for op in ops {
                    match op {
                        Op::Set(k, c) => {
                            let before = cache.total_cost();
                            let stored = cache.set(k, k, c);
                            if c > 64 {
                                prop_assert!(!stored);
                                prop_assert_eq!(cache.total_cost(), before);
                            }
                        }
                        Op::Get(k) => { cache.get(&k); }
                        Op::Remove(k) => { cache.remove(&k); }
                    }
                    prop_assert!(cache.total_cost() <= 64);
                }
            }

            #[test]
            fn test_recently_read_key_survives(filler in 2usize..10) {
                // Capacity for `filler` unit entries; key 0 is read before each insert.
                let cache = MemoryCache::<usize, usize>::new(MemoryCacheConfig::with_cost_limit(filler));
                cache.set(0, 0, 1);
                for k in 1..(filler * 3) {
                    prop_assert_eq!(cache.get(&0), Some(0));
                    cache.set(k, k, 1);
                }
                prop_assert!(cache.contains(&0));
            }
        }
    }
}
