//! Bounded map with LRU eviction and idle expiry
//!
//! [`ExpiringCache`] combines an optional capacity (least recently used
//! entry evicted on insert) with an optional idle timeout measured from the
//! last touch. Expired entries are dropped lazily when accessed and in bulk
//! by [`ExpiringCache::purge_expired`]. Callers get evicted entries back so
//! they can report them.

use coala_io::{Clock, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

struct Slot<V> {
    value: V,
    touched: Timestamp,
    stamp: u64,
}

/// Map with optional capacity and idle expiry
pub struct ExpiringCache<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// Recency order: oldest stamp first
    order: BTreeMap<u64, K>,
    next_stamp: u64,
    capacity: Option<usize>,
    idle: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash + Clone, V> ExpiringCache<K, V> {
    pub fn new(capacity: Option<usize>, idle: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        ExpiringCache {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
            capacity,
            idle,
            clock,
        }
    }

    /// Capacity-bounded cache without idle expiry
    pub fn with_capacity(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        ExpiringCache::new(Some(capacity), None, clock)
    }

    /// Unbounded cache whose entries expire after `idle` without access
    pub fn with_idle(idle: Duration, clock: Arc<dyn Clock>) -> Self {
        ExpiringCache::new(None, Some(idle), clock)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace, returning the entry evicted to make room
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let now = self.clock.now();
        let stamp = self.bump();
        if let Some(slot) = self.entries.get_mut(&key) {
            self.order.remove(&slot.stamp);
            slot.value = value;
            slot.touched = now;
            slot.stamp = stamp;
            self.order.insert(stamp, key);
            return None;
        }

        let evicted = match self.capacity {
            Some(capacity) if self.entries.len() >= capacity => self.evict_oldest(),
            _ => None,
        };
        self.order.insert(stamp, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                touched: now,
                stamp,
            },
        );
        evicted
    }

    /// Look up and touch an entry
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.get_mut(key).map(|value| &*value)
    }

    /// Look up and touch an entry mutably
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.expire_if_idle(key) {
            return None;
        }
        let now = self.clock.now();
        let stamp = self.bump();
        let slot = self.entries.get_mut(key)?;
        self.order.remove(&slot.stamp);
        self.order.insert(stamp, key.clone());
        slot.stamp = stamp;
        slot.touched = now;
        Some(&mut slot.value)
    }

    /// Look up without touching
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = self.entries.get(key)?;
        if self.is_idle(slot) {
            return None;
        }
        Some(&slot.value)
    }

    /// Look up mutably without touching
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.expire_if_idle(key) {
            return None;
        }
        self.entries.get_mut(key).map(|slot| &mut slot.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.stamp);
        Some(slot.value)
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> Vec<K> {
        self.order.values().cloned().collect()
    }

    /// Entries from least to most recently used, idle ones skipped
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.order.values().filter_map(move |key| {
            let slot = self.entries.get(key)?;
            if self.is_idle(slot) {
                None
            } else {
                Some((key, &slot.value))
            }
        })
    }

    /// Drop every idle entry, returning them
    pub fn purge_expired(&mut self) -> Vec<(K, V)> {
        let idle: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, slot)| self.is_idle(slot))
            .map(|(key, _)| key.clone())
            .collect();
        idle.into_iter()
            .filter_map(|key| self.remove(&key).map(|value| (key, value)))
            .collect()
    }

    /// Remove everything, oldest first
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let order = std::mem::take(&mut self.order);
        let mut entries = std::mem::take(&mut self.entries);
        order
            .into_values()
            .filter_map(|key| entries.remove(&key).map(|slot| (key, slot.value)))
            .collect()
    }

    fn bump(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    fn is_idle(&self, slot: &Slot<V>) -> bool {
        match self.idle {
            Some(idle) => self.clock.now() - slot.touched >= idle,
            None => false,
        }
    }

    fn expire_if_idle(&mut self, key: &K) -> bool {
        let idle = match self.entries.get(key) {
            Some(slot) => self.is_idle(slot),
            None => return false,
        };
        if idle {
            self.remove(key);
        }
        idle
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        Some((key, slot.value))
    }
}
