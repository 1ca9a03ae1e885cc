//! Least-recently-used cache bounded by approximate byte size.
//!
//! Entry count alone is a poor bound for tiles: a dense downtown tile can
//! be a thousand times larger than an empty suburban one. [`SizedCache`]
//! charges every entry the size reported by its estimator and evicts the
//! least recently used entries until the total fits the budget.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Estimates the in-memory footprint of one entry in bytes.
pub type SizeEstimator<K, V> = fn(&K, &V) -> usize;

struct Slot<V> {
    value: V,
    bytes: usize,
    tick: u64,
}

/// A byte-budgeted LRU map.
///
/// Not internally synchronized; wrap it in a `Mutex` to share.
pub struct SizedCache<K, V> {
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    estimator: SizeEstimator<K, V>,
    capacity_bytes: usize,
    total_bytes: usize,
    next_tick: u64,
}

impl<K: Eq + Hash + Clone, V> SizedCache<K, V> {
    /// Creates an empty cache that holds at most `capacity_bytes` worth of
    /// entries according to `estimator`.
    #[must_use]
    pub fn new(capacity_bytes: usize, estimator: SizeEstimator<K, V>) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            estimator,
            capacity_bytes,
            total_bytes: 0,
            next_tick: 0,
        }
    }

    const fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Returns the value for `key` and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.bump();
        let slot = self.entries.get_mut(key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.clone());
        Some(&slot.value)
    }

    /// Returns the value for `key` without touching recency.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts `value`, evicting least recently used entries as needed.
    ///
    /// Returns the number of entries evicted. An entry larger than the
    /// whole budget is not stored at all.
    pub fn insert(&mut self, key: K, value: V) -> usize {
        let bytes = (self.estimator)(&key, &value);
        self.remove(&key);
        if bytes > self.capacity_bytes {
            log::debug!(
                "Skipping cache insert of {bytes} bytes (budget {})",
                self.capacity_bytes
            );
            return 0;
        }

        let mut evicted = 0;
        while self.total_bytes + bytes > self.capacity_bytes {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&oldest) {
                self.total_bytes -= slot.bytes;
                evicted += 1;
            }
        }

        let tick = self.bump();
        self.order.insert(tick, key.clone());
        self.entries.insert(key, Slot { value, bytes, tick });
        self.total_bytes += bytes;
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        self.total_bytes -= slot.bytes;
        Some(slot.value)
    }

    /// Keeps only entries for which `keep` returns `true`.
    pub fn retain<F: FnMut(&K, &V) -> bool>(&mut self, mut keep: F) {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|(key, slot)| !keep(key, &slot.value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            self.remove(&key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_bytes = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[must_use]
    pub const fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Iterates entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(key, slot)| (key, &slot.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_len(_key: &u32, value: &Vec<u8>) -> usize {
        value.len()
    }

    #[test]
    fn evicts_least_recently_used_by_bytes() {
        let mut cache = SizedCache::new(100, byte_len);
        cache.insert(1, vec![0; 40]);
        cache.insert(2, vec![0; 40]);
        assert!(cache.get(&1).is_some());

        let evicted = cache.insert(3, vec![0; 40]);
        assert_eq!(evicted, 1);
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(cache.total_bytes(), 80);
    }

    #[test]
    fn one_large_entry_evicts_many_small_ones() {
        let mut cache = SizedCache::new(100, byte_len);
        for key in 0..10 {
            cache.insert(key, vec![0; 10]);
        }
        assert_eq!(cache.len(), 10);
        let evicted = cache.insert(99, vec![0; 95]);
        assert_eq!(evicted, 10);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn oversized_entry_is_not_stored() {
        let mut cache = SizedCache::new(10, byte_len);
        cache.insert(1, vec![0; 5]);
        assert_eq!(cache.insert(2, vec![0; 11]), 0);
        assert!(!cache.contains(&2));
        assert!(cache.contains(&1));
    }

    #[test]
    fn replacing_a_key_updates_size() {
        let mut cache = SizedCache::new(100, byte_len);
        cache.insert(1, vec![0; 60]);
        cache.insert(1, vec![0; 20]);
        assert_eq!(cache.total_bytes(), 20);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn retain_drops_rejected_entries() {
        let mut cache = SizedCache::new(100, byte_len);
        cache.insert(1, vec![0; 10]);
        cache.insert(2, vec![0; 10]);
        cache.retain(|key, _| *key == 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 10);
        assert!(cache.peek(&2).is_some());
    }
}
