//! Adaptive Replacement Cache (ARC)
//!
//! ARC combines recency and frequency to make eviction decisions,
//! automatically adapting to workload patterns. It maintains:
//!
//! - T1: Recently accessed entries (seen once recently)
//! - T2: Frequently accessed entries (seen multiple times)
//! - B1: Ghost entries recently evicted from T1
//! - B2: Ghost entries recently evicted from T2
//!
//! The algorithm adapts the target size of T1 vs T2 based on ghost hits.
//!
//! Lists are queues of `(key, stamp)`. Moving a key pushes a fresh stamp and
//! leaves the old slot behind; stale slots are skipped when popping and
//! compacted away once they outnumber live ones.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::Liveness;

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

/// Which list a key is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    T1 = 0,
    T2 = 1,
    B1 = 2,
    B2 = 3,
}

#[derive(Default)]
struct Queue {
    slots: VecDeque<(Bytes, u64)>,
    len: usize,
}

struct Entry {
    value: Bytes,
    expiry: i64,
}

/// ARC cache internal state
struct ArcState {
    lists: [Queue; 4],
    /// Current list and stamp of every tracked key, ghosts included
    location: HashMap<Bytes, (List, u64)>,
    /// Cached values (keys in T1 or T2)
    values: HashMap<Bytes, Entry>,
    next_stamp: u64,
    /// Target size for T1 (adaptive parameter)
    p: usize,
    capacity: usize,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            lists: Default::default(),
            location: HashMap::new(),
            values: HashMap::with_capacity(capacity),
            next_stamp: 0,
            p: 0,
            capacity,
        }
    }

    fn len(&self, list: List) -> usize {
        self.lists[list as usize].len
    }

    fn find(&self, key: &[u8]) -> Option<List> {
        self.location.get(key).map(|(list, _)| *list)
    }

    /// Move `key` to the MRU end of `to`
    fn push(&mut self, key: Bytes, to: List) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some((from, _)) = self.location.insert(key.clone(), (to, stamp)) {
            self.lists[from as usize].len -= 1;
        }
        let queue = &mut self.lists[to as usize];
        queue.slots.push_back((key, stamp));
        queue.len += 1;
        if queue.slots.len() > 2 * queue.len + 32 {
            self.compact(to);
        }
    }

    /// Forget `key` entirely
    fn detach(&mut self, key: &[u8]) {
        if let Some((list, _)) = self.location.remove(key) {
            self.lists[list as usize].len -= 1;
        }
    }

    /// Pop the LRU key of `list`
    fn pop(&mut self, list: List) -> Option<Bytes> {
        while let Some((key, stamp)) = self.lists[list as usize].slots.pop_front() {
            if self.location.get(&key) == Some(&(list, stamp)) {
                self.location.remove(&key);
                self.lists[list as usize].len -= 1;
                return Some(key);
            }
        }
        None
    }

    fn compact(&mut self, list: List) {
        let location = &self.location;
        self.lists[list as usize]
            .slots
            .retain(|(key, stamp)| location.get(key) == Some(&(list, *stamp)));
    }

    fn cache_size(&self) -> usize {
        self.len(List::T1) + self.len(List::T2)
    }

    fn ghost_size(&self) -> usize {
        self.len(List::B1) + self.len(List::B2)
    }
}

/// Adaptive Replacement Cache over encoded keys and values
pub struct ArcCache {
    state: Mutex<ArcState>,
    stats: CacheStats,
}

impl ArcCache {
    /// Create a new ARC cache with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArcState::new(capacity.max(1))),
            stats: CacheStats::default(),
        }
    }

    /// Look up a live value, promoting it; expired values are dropped
    pub fn get(&self, key: &[u8], now: i64) -> Option<Bytes> {
        let mut state = self.state.lock();
        if !matches!(state.find(key), Some(List::T1 | List::T2)) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let Some((key, value, expiry)) = state
            .values
            .get_key_value(key)
            .map(|(k, e)| (k.clone(), e.value.clone(), e.expiry))
        else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if !Liveness::of(expiry, now).is_alive() {
            state.values.remove(&key);
            state.detach(&key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        // A hit in T1 or T2 makes the key frequent
        state.push(key, List::T2);
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Look up a value without touching recency or stats
    pub fn peek(&self, key: &[u8]) -> Option<Bytes> {
        self.state.lock().values.get(key).map(|e| e.value.clone())
    }

    /// Put a value into the cache
    pub fn put(&self, key: Bytes, value: Bytes, expiry: i64) {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        let entry = Entry { value, expiry };

        match state.find(&key) {
            // Case 1: cached, update value and move to T2
            Some(List::T1 | List::T2) => {
                state.values.insert(key.clone(), entry);
                state.push(key, List::T2);
            }
            // Case 2: ghost of T1, favor recency
            Some(List::B1) => {
                let delta = (state.len(List::B2) / state.len(List::B1).max(1)).max(1);
                state.p = (state.p + delta).min(capacity);
                if state.cache_size() >= capacity {
                    self.replace(&mut state, false);
                }
                state.values.insert(key.clone(), entry);
                state.push(key, List::T2);
            }
            // Case 3: ghost of T2, favor frequency
            Some(List::B2) => {
                let delta = (state.len(List::B1) / state.len(List::B2).max(1)).max(1);
                state.p = state.p.saturating_sub(delta);
                if state.cache_size() >= capacity {
                    self.replace(&mut state, true);
                }
                state.values.insert(key.clone(), entry);
                state.push(key, List::T2);
            }
            // Case 4: new entry
            None => {
                let l1_size = state.len(List::T1) + state.len(List::B1);
                if l1_size >= capacity {
                    if state.len(List::T1) < capacity {
                        state.pop(List::B1);
                        if state.cache_size() >= capacity {
                            self.replace(&mut state, false);
                        }
                    } else if let Some(evicted) = state.pop(List::T1) {
                        state.values.remove(&evicted);
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                } else if state.cache_size() + state.ghost_size() >= capacity {
                    if state.cache_size() + state.ghost_size() >= 2 * capacity {
                        state.pop(List::B2);
                    }
                    if state.cache_size() >= capacity {
                        self.replace(&mut state, false);
                    }
                }
                state.values.insert(key.clone(), entry);
                state.push(key, List::T1);
            }
        }
    }

    /// Remove a value from the cache
    pub fn remove(&self, key: &[u8]) -> Option<Bytes> {
        let mut state = self.state.lock();
        let removed = state.values.remove(key).map(|e| e.value);
        if removed.is_some() {
            state.detach(key);
        }
        removed
    }

    /// Evict the LRU entry of T1 or T2 into its ghost list
    fn replace(&self, state: &mut ArcState, in_b2: bool) {
        if state.cache_size() == 0 {
            return;
        }
        let t1_len = state.len(List::T1);
        let evict_from_t1 = t1_len > 0 && (t1_len > state.p || (in_b2 && t1_len == state.p));
        let order = if evict_from_t1 {
            [(List::T1, List::B1), (List::T2, List::B2)]
        } else {
            [(List::T2, List::B2), (List::T1, List::B1)]
        };
        for (from, ghost) in order {
            if let Some(evicted) = state.pop(from) {
                state.values.remove(&evicted);
                state.push(evicted, ghost);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Clear the entire cache
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        *state = ArcState::new(capacity);
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached values
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Get diagnostic info about internal state
    #[cfg(test)]
    pub fn debug_info(&self) -> ArcDebugInfo {
        let state = self.state.lock();
        ArcDebugInfo {
            t1_len: state.len(List::T1),
            t2_len: state.len(List::T2),
            b1_len: state.len(List::B1),
            b2_len: state.len(List::B2),
            p: state.p,
        }
    }
}

/// Debug information about ARC state
#[cfg(test)]
#[derive(Debug)]
pub struct ArcDebugInfo {
    pub t1_len: usize,
    pub t2_len: usize,
    pub b1_len: usize,
    pub b2_len: usize,
    pub p: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn key(i: u32) -> Bytes {
        Bytes::from(format!("key-{i}"))
    }

    fn val(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_arc_basic_put_get() {
        let cache = ArcCache::new(10);
        cache.put(key(1), val("value1"), 0);
        cache.put(key(2), val("value2"), 0);

        assert_eq!(cache.get(&key(1), 0), Some(val("value1")));
        assert_eq!(cache.get(&key(2), 0), Some(val("value2")));
        assert_eq!(cache.get(&key(3), 0), None);
    }

    #[test]
    fn test_arc_eviction() {
        let cache = ArcCache::new(3);
        cache.put(key(1), val("v1"), 0);
        cache.put(key(2), val("v2"), 0);
        cache.put(key(3), val("v3"), 0);
        assert_eq!(cache.len(), 3);

        // Should evict key 1 (oldest in T1)
        cache.put(key(4), val("v4"), 0);
        assert_eq!(cache.len(), 3);
        assert!(cache.peek(&key(1)).is_none());
        assert_eq!(cache.get(&key(4), 0), Some(val("v4")));
    }

    #[test]
    fn test_arc_frequency_promotion() {
        let cache = ArcCache::new(4);
        cache.put(key(1), val("v1"), 0);
        cache.put(key(2), val("v2"), 0);
        cache.get(&key(1), 0);
        cache.get(&key(1), 0);

        let info = cache.debug_info();
        assert_eq!(info.t2_len, 1);
        assert_eq!(info.t1_len, 1);
    }

    #[test]
    fn test_arc_ghost_hit_goes_to_t2() {
        let cache = ArcCache::new(2);
        cache.put(key(1), val("v1"), 0);
        cache.put(key(2), val("v2"), 0);
        cache.get(&key(1), 0);

        // Full cache: key 2 is the LRU of T1 and becomes a ghost
        cache.put(key(3), val("v3"), 0);
        assert_eq!(cache.debug_info().b1_len, 1);
        assert!(cache.peek(&key(2)).is_none());

        cache.put(key(2), val("v2_new"), 0);
        let info = cache.debug_info();
        assert_eq!(info.p, 1);
        assert_eq!(info.t2_len, 1);
        assert_eq!(info.b2_len, 1);
        assert_eq!(cache.get(&key(2), 0), Some(val("v2_new")));
    }

    #[test]
    fn test_arc_expired_entries_dropped() {
        let cache = ArcCache::new(4);
        cache.put(key(1), val("v1"), 100);
        assert_eq!(cache.get(&key(1), 50), Some(val("v1")));
        assert_eq!(cache.get(&key(1), 101), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_arc_remove_and_stats() {
        let cache = ArcCache::new(10);
        cache.put(key(1), val("value"), 0);
        cache.get(&key(1), 0);
        cache.get(&key(2), 0);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
        assert!((cache.stats().hit_ratio() - 0.5).abs() < f64::EPSILON);

        assert_eq!(cache.remove(&key(1)), Some(val("value")));
        assert!(cache.peek(&key(1)).is_none());
        assert_eq!(cache.debug_info().t2_len, 0);
    }

    #[test]
    fn test_arc_bounded_under_random_load() {
        let cache = ArcCache::new(16);
        let mut rng = rand::thread_rng();
        for _ in 0..5_000 {
            let k = key(rng.gen_range(0..64));
            if rng.r#gen::<bool>() {
                cache.put(k, val("v"), 0);
            } else {
                cache.get(&k, 0);
            }
            let info = cache.debug_info();
            assert!(info.t1_len + info.t2_len <= 16);
            assert!(info.t1_len + info.t2_len + info.b1_len + info.b2_len <= 32);
            assert_eq!(cache.len(), info.t1_len + info.t2_len);
        }
    }

    #[test]
    fn test_arc_clear() {
        let cache = ArcCache::new(10);
        cache.put(key(1), val("v1"), 0);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 10);
        assert!(cache.get(&key(1), 0).is_none());
    }
}
