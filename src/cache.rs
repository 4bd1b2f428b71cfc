// ⏱️ TTL Cache - Explicit, injected read cache
// Entries expire after a fixed TTL; when full, expired entries go first,
// then the oldest insertion.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        TtlCache {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &K, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => now.duration_since(entry.inserted_at) >= self.ttl,
            None => return None,
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&mut self, key: K, value: V, now: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict(now);
        }

        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.inserted_at) < ttl);

        if self.entries.len() < self.max_entries {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.inserted_at)
            .map(|(k, _)| k.clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire() {
        let start = Instant::now();
        let mut cache = TtlCache::new(Duration::from_secs(30), 10);

        cache.insert_at("user-1", 1, start);
        assert_eq!(cache.get_at(&"user-1", start + Duration::from_secs(29)), Some(1));
        assert_eq!(cache.get_at(&"user-1", start + Duration::from_secs(30)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_expired_before_oldest() {
        let start = Instant::now();
        let mut cache = TtlCache::new(Duration::from_secs(10), 2);

        cache.insert_at("a", 1, start);
        cache.insert_at("b", 2, start + Duration::from_secs(8));
        // "a" has expired by now and is dropped instead of "b"
        cache.insert_at("c", 3, start + Duration::from_secs(12));

        assert_eq!(cache.len(), 2);
        let now = start + Duration::from_secs(13);
        assert_eq!(cache.get_at(&"b", now), Some(2));
        assert_eq!(cache.get_at(&"c", now), Some(3));
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let start = Instant::now();
        let mut cache = TtlCache::new(Duration::from_secs(60), 2);

        cache.insert_at("a", 1, start);
        cache.insert_at("b", 2, start + Duration::from_secs(1));
        cache.insert_at("c", 3, start + Duration::from_secs(2));

        let now = start + Duration::from_secs(3);
        assert_eq!(cache.get_at(&"a", now), None);
        assert_eq!(cache.get_at(&"b", now), Some(2));
        assert_eq!(cache.get_at(&"c", now), Some(3));
    }

    #[test]
    fn test_invalidate() {
        let mut cache = TtlCache::new(Duration::from_secs(60), 4);
        cache.insert("user-1".to_string(), vec![1, 2]);
        cache.invalidate(&"user-1".to_string());
        assert_eq!(cache.get(&"user-1".to_string()), None);
    }
}
