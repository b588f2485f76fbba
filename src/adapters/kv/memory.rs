// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process ordered key/value store.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::Mutex;

use super::{borrowed, scan_bounds, Change, KvError, OrderedKv};

/// `BTreeMap` behind a mutex. Every `modify` runs under the lock, so
/// read-modify-write is atomic.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl OrderedKv for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn modify(&self, key: &str, f: &mut dyn FnMut(Option<&[u8]>) -> Change) -> Result<(), KvError> {
        let mut map = self.map.lock();
        match f(map.get(key).map(Vec::as_slice)) {
            Change::Keep => {}
            Change::Put(value) => {
                map.insert(key.to_string(), value);
            }
            Change::Delete => {
                map.remove(key);
            }
        }
        Ok(())
    }

    fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let (lower, upper) = scan_bounds(prefix, after, reverse);
        let map = self.map.lock();
        let range = map.range::<str, (Bound<&str>, Bound<&str>)>((borrowed(&lower), borrowed(&upper)));
        let matching = |(k, _): &(&String, &Vec<u8>)| k.starts_with(prefix);
        let out = if reverse {
            range.rev().take_while(matching).take(limit).map(|(k, v)| (k.clone(), v.clone())).collect()
        } else {
            range.take_while(matching).take(limit).map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        Ok(out)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, KvError> {
        let mut map = self.map.lock();
        let keys: Vec<String> = map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            map.remove(key);
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> MemoryKv {
        let kv = MemoryKv::new();
        for key in ["a\u{1}1", "b\u{1}1", "b\u{1}2", "b\u{1}3", "c\u{1}1"] {
            kv.modify(key, &mut |_| Change::Put(key.as_bytes().to_vec())).unwrap();
        }
        kv
    }

    fn keys(rows: Vec<(String, Vec<u8>)>) -> Vec<String> {
        rows.into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_prefix_scan_forward_and_resume() {
        let kv = filled();
        assert_eq!(keys(kv.scan("b\u{1}", None, 2, false).unwrap()), vec!["b\u{1}1", "b\u{1}2"]);
        assert_eq!(keys(kv.scan("b\u{1}", Some("b\u{1}2"), 10, false).unwrap()), vec!["b\u{1}3"]);
    }

    #[test]
    fn test_prefix_scan_reverse() {
        let kv = filled();
        assert_eq!(
            keys(kv.scan("b\u{1}", None, 10, true).unwrap()),
            vec!["b\u{1}3", "b\u{1}2", "b\u{1}1"]
        );
        assert_eq!(keys(kv.scan("b\u{1}", Some("b\u{1}2"), 10, true).unwrap()), vec!["b\u{1}1"]);
    }

    #[test]
    fn test_delete_prefix() {
        let kv = filled();
        assert_eq!(kv.delete_prefix("b\u{1}").unwrap(), 3);
        assert_eq!(kv.len(), 2);
    }
}
