// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! LMDB store (heed).

use std::fs;
use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use tracing::debug;

use super::{borrowed, scan_bounds, Change, KvError, OrderedKv};

pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

const DB_NAME: &str = "polystore";

/// One LMDB environment with a single named database. LMDB serializes
/// write transactions, so `modify` is atomic across clients and processes.
pub struct LmdbKv {
    env: Env,
    db: Database<Str, Bytes>,
}

impl LmdbKv {
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self, KvError> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;

        let mut options = EnvOpenOptions::new();
        options.map_size(map_size);
        options.max_dbs(4);

        // SAFETY: the directory exists and this process opens each
        // environment path once per adapter.
        let env = unsafe { options.open(path)? };

        let mut wtxn = env.write_txn()?;
        let db: Database<Str, Bytes> = env.create_database(&mut wtxn, Some(DB_NAME))?;
        wtxn.commit()?;

        debug!(path = %path.display(), map_size, "opened lmdb environment");
        Ok(Self { env, db })
    }
}

impl OrderedKv for LmdbKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.get(&rtxn, key)?.map(<[u8]>::to_vec))
    }

    fn modify(&self, key: &str, f: &mut dyn FnMut(Option<&[u8]>) -> Change) -> Result<(), KvError> {
        let mut wtxn = self.env.write_txn()?;
        let change = f(self.db.get(&wtxn, key)?);
        match change {
            Change::Keep => {
                wtxn.abort();
                return Ok(());
            }
            Change::Put(value) => self.db.put(&mut wtxn, key, &value)?,
            Change::Delete => {
                self.db.delete(&mut wtxn, key)?;
            }
        }
        wtxn.commit()?;
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
        let range = (borrowed(&lower), borrowed(&upper));
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        if reverse {
            for entry in self.db.rev_range(&rtxn, &range)? {
                let (key, value) = entry?;
                if !key.starts_with(prefix) || out.len() >= limit {
                    break;
                }
                out.push((key.to_string(), value.to_vec()));
            }
        } else {
            for entry in self.db.range(&rtxn, &range)? {
                let (key, value) = entry?;
                if !key.starts_with(prefix) || out.len() >= limit {
                    break;
                }
                out.push((key.to_string(), value.to_vec()));
            }
        }
        Ok(out)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, KvError> {
        let mut wtxn = self.env.write_txn()?;
        let keys: Vec<String> = {
            let mut keys = Vec::new();
            for entry in self.db.prefix_iter(&wtxn, prefix)? {
                let (key, _) = entry?;
                keys.push(key.to_string());
            }
            keys
        };
        for key in &keys {
            self.db.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lmdb_modify_scan_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = LmdbKv::open(dir.path(), 10 * 1024 * 1024).unwrap();
            for key in ["t\u{1}1", "t\u{1}2", "t\u{1}3", "u\u{1}1"] {
                kv.modify(key, &mut |_| Change::Put(key.as_bytes().to_vec())).unwrap();
            }
            kv.modify("t\u{1}2", &mut |current| {
                assert!(current.is_some());
                Change::Delete
            })
            .unwrap();

            let forward: Vec<String> = kv.scan("t\u{1}", None, 10, false).unwrap().into_iter().map(|(k, _)| k).collect();
            assert_eq!(forward, vec!["t\u{1}1", "t\u{1}3"]);
            let back: Vec<String> = kv.scan("t\u{1}", None, 1, true).unwrap().into_iter().map(|(k, _)| k).collect();
            assert_eq!(back, vec!["t\u{1}3"]);
        }

        let kv = LmdbKv::open(dir.path(), 10 * 1024 * 1024).unwrap();
        assert_eq!(kv.get("u\u{1}1").unwrap(), Some(b"u\x011".to_vec()));
        assert_eq!(kv.delete_prefix("t\u{1}").unwrap(), 2);
    }
}
