//! Expiring map used to correlate job ids with pending results.
//!
//! Entries expire a fixed time after insertion. Expired entries are dropped
//! lazily on access and in bulk by [`TtlCache::purge_expired`], which the
//! client calls from a periodic sweep task. When the cache is full, inserting
//! evicts expired entries first and then the oldest live entry.
//!
//! Eviction bounds memory for abandoned jobs. It is a liveness mechanism only:
//! a response that arrives for an evicted job is silently unroutable.

use core::hash::Hash;
use core::time::Duration;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<K, (Instant, V)>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Inserts `value` under `key`, returning the entry it displaced (if any).
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let now = Instant::now();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.purge_expired_at(now);
            if self.entries.len() >= self.capacity {
                self.evict_oldest();
            }
        }
        self.entries.insert(key, (now, value)).map(|(_, v)| v)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.expire_key(key);
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.expire_key(key);
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, inserted: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted) >= self.ttl
    }

    fn expire_key(&mut self, key: &K) {
        let now = Instant::now();
        if let Some((inserted, _)) = self.entries.get(key) {
            if self.is_expired(*inserted, now) {
                self.entries.remove(key);
            }
        }
    }

    fn purge_expired_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, (inserted, _)| now.saturating_duration_since(*inserted) < ttl);
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, (inserted, _))| *inserted)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let mut cache = TtlCache::new(Duration::from_secs(10), 8);
        cache.insert("a", 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get(&"a"), Some(&1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let mut cache = TtlCache::new(Duration::from_secs(10), 8);
        cache.insert("old", 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert("new", 2);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove(&"new"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_oldest_entry() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("first", 1);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("second", 2);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("third", 3);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key(&"first"));
        assert!(cache.contains_key(&"second"));
        assert!(cache.contains_key(&"third"));
    }

    #[tokio::test(start_paused = true)]
    async fn reinserting_existing_key_does_not_evict() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.insert("a", 10), Some(1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), Some(&2));
    }
}
