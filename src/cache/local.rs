// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local cache tier.
//!
//! A concurrent map of JSON values with a per-entry deadline. Expired
//! entries are dropped when read and swept when the map reaches
//! `max_entries`; if a sweep frees nothing, the entry closest to expiry is
//! evicted.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

struct Entry {
    value: Value,
    expires: Instant,
}

pub struct LocalCache {
    entries: DashMap<String, Entry>,
    max_entries: usize,
}

impl LocalCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self { entries: DashMap::new(), max_entries: max_entries.max(1) }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.expires <= now);
        None
    }

    pub fn insert(&self, key: String, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        self.entries.insert(key, Entry { value, expires: Instant::now() + ttl });
        crate::metrics::set_local_cache_entries(self.entries.len());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        crate::metrics::set_local_cache_entries(0);
    }

    fn make_room(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires > now);
        if self.entries.len() < self.max_entries {
            return;
        }
        let soonest = self.entries.iter().min_by_key(|e| e.expires).map(|e| e.key().clone());
        if let Some(key) = soonest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_expire() {
        let cache = LocalCache::new(10);
        cache.insert("a".into(), json!(1), Duration::from_millis(20));
        cache.insert("b".into(), json!(2), Duration::from_secs(60));
        assert_eq!(cache.get("a"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_full_cache_evicts_soonest_expiry() {
        let cache = LocalCache::new(2);
        cache.insert("short".into(), json!(1), Duration::from_secs(1));
        cache.insert("long".into(), json!(2), Duration::from_secs(60));
        cache.insert("new".into(), json!(3), Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("short").is_none());
        assert!(cache.get("long").is_some());

        // Overwriting an existing key never evicts.
        cache.insert("long".into(), json!(4), Duration::from_secs(60));
        assert_eq!(cache.get("new"), Some(json!(3)));
    }

    #[test]
    fn test_zero_ttl_is_not_stored() {
        let cache = LocalCache::new(2);
        cache.insert("a".into(), json!(1), Duration::ZERO);
        assert!(cache.is_empty());
        assert!(!cache.remove("a"));
    }
}
