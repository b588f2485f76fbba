// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Native Redis surface used by the adapter: hashes, optimistic
//! transactions and `SCAN`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ::redis::aio::ConnectionManager;
use ::redis::{ErrorKind, RedisError};
use serde_json::Value;

pub type NativeResult<T> = std::result::Result<T, RedisError>;

/// One command queued inside `MULTI`/`EXEC`.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// `HSET key f v ...`
    Set { key: String, fields: Vec<(String, String)> },
    /// `HINCRBY` / `HINCRBYFLOAT` depending on `by`.
    Incr { key: String, field: String, by: Value },
    /// `HDEL key field`
    DelField { key: String, field: String },
    /// `DEL key`
    Del { key: String },
}

/// One exclusively-owned Redis connection. `watch` state belongs to it, so
/// a client must not be shared while a transaction is open.
#[async_trait]
pub trait RedisNative: Send + 'static {
    /// `HGETALL`; empty when the key does not exist.
    async fn hgetall(&mut self, key: &str) -> NativeResult<HashMap<String, String>>;

    async fn watch(&mut self, key: &str) -> NativeResult<()>;

    async fn unwatch(&mut self) -> NativeResult<()>;

    /// Run `writes` in `MULTI`/`EXEC`. `false` when a watched key changed and
    /// the transaction was discarded.
    async fn exec(&mut self, writes: &[Write]) -> NativeResult<bool>;

    /// `DEL`, returning how many keys were removed.
    async fn del(&mut self, key: &str) -> NativeResult<u64>;

    /// `SCAN cursor MATCH pattern COUNT count`.
    async fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> NativeResult<(u64, Vec<String>)>;
}

/// Escape glob metacharacters in a literal key part.
#[must_use]
pub fn glob_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Redis `MATCH` semantics for `*`, `?` and `\` escapes.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                star = Some((pi, ti));
                pi += 1;
            }
            Some('?') => {
                pi += 1;
                ti += 1;
            }
            Some('\\') if p.get(pi + 1) == Some(&t[ti]) => {
                pi += 2;
                ti += 1;
            }
            Some(c) if *c != '\\' && *c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    pi = sp + 1;
                    ti = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Connection to a Redis server.
pub struct ServerRedis {
    conn: ConnectionManager,
}

impl ServerRedis {
    pub async fn connect(client: &::redis::Client) -> NativeResult<Self> {
        Ok(Self { conn: ConnectionManager::new(client.clone()).await? })
    }
}

#[async_trait]
impl RedisNative for ServerRedis {
    async fn hgetall(&mut self, key: &str) -> NativeResult<HashMap<String, String>> {
        ::redis::cmd("HGETALL").arg(key).query_async(&mut self.conn).await
    }

    async fn watch(&mut self, key: &str) -> NativeResult<()> {
        ::redis::cmd("WATCH").arg(key).query_async(&mut self.conn).await
    }

    async fn unwatch(&mut self) -> NativeResult<()> {
        ::redis::cmd("UNWATCH").query_async(&mut self.conn).await
    }

    async fn exec(&mut self, writes: &[Write]) -> NativeResult<bool> {
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for write in writes {
            match write {
                Write::Set { key, fields } => {
                    pipe.cmd("HSET").arg(key).arg(fields);
                }
                Write::Incr { key, field, by } => match by.as_i64() {
                    Some(n) => {
                        pipe.cmd("HINCRBY").arg(key).arg(field).arg(n);
                    }
                    None => {
                        pipe.cmd("HINCRBYFLOAT").arg(key).arg(field).arg(by.as_f64().unwrap_or_default());
                    }
                },
                Write::DelField { key, field } => {
                    pipe.cmd("HDEL").arg(key).arg(field);
                }
                Write::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
            }
        }
        // EXEC answers nil when a watched key was touched.
        let reply: Option<::redis::Value> = pipe.query_async(&mut self.conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&mut self, key: &str) -> NativeResult<u64> {
        ::redis::cmd("DEL").arg(key).query_async(&mut self.conn).await
    }

    async fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> NativeResult<(u64, Vec<String>)> {
        ::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    hashes: BTreeMap<String, HashMap<String, String>>,
    versions: HashMap<String, u64>,
}

impl MemoryState {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// In-process Redis keyspace with hash, `WATCH` and `SCAN` semantics.
/// Every [`connect`](Self::connect) returns a new connection to the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryRedis {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRedis {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connect(&self) -> MemoryRedisConn {
        MemoryRedisConn { state: self.state.clone(), watched: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().hashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MemoryRedisConn {
    state: Arc<Mutex<MemoryState>>,
    watched: Vec<(String, u64)>,
}

fn not_a_number() -> RedisError {
    RedisError::from((ErrorKind::TypeError, "hash value is not a number"))
}

fn apply(state: &mut MemoryState, write: &Write) -> NativeResult<()> {
    match write {
        Write::Set { key, fields } => {
            let hash = state.hashes.entry(key.clone()).or_default();
            for (f, v) in fields {
                hash.insert(f.clone(), v.clone());
            }
            state.touch(key);
        }
        Write::Incr { key, field, by } => {
            let hash = state.hashes.entry(key.clone()).or_default();
            let current = hash.get(field).map_or("0", String::as_str);
            let next = match by.as_i64() {
                Some(n) => current.parse::<i64>().map_err(|_| not_a_number())?.saturating_add(n).to_string(),
                None => {
                    let sum = current.parse::<f64>().map_err(|_| not_a_number())? + by.as_f64().unwrap_or_default();
                    sum.to_string()
                }
            };
            hash.insert(field.clone(), next);
            state.touch(key);
        }
        Write::DelField { key, field } => {
            if let Some(hash) = state.hashes.get_mut(key) {
                hash.remove(field);
                if hash.is_empty() {
                    state.hashes.remove(key);
                }
            }
            state.touch(key);
        }
        Write::Del { key } => {
            state.hashes.remove(key);
            state.touch(key);
        }
    }
    Ok(())
}

#[async_trait]
impl RedisNative for MemoryRedisConn {
    async fn hgetall(&mut self, key: &str) -> NativeResult<HashMap<String, String>> {
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn watch(&mut self, key: &str) -> NativeResult<()> {
        let version = self.state.lock().version(key);
        self.watched.push((key.to_string(), version));
        Ok(())
    }

    async fn unwatch(&mut self) -> NativeResult<()> {
        self.watched.clear();
        Ok(())
    }

    async fn exec(&mut self, writes: &[Write]) -> NativeResult<bool> {
        let watched = std::mem::take(&mut self.watched);
        let mut state = self.state.lock();
        if watched.iter().any(|(key, version)| state.version(key) != *version) {
            return Ok(false);
        }
        // Validate increments up front so a failing command leaves nothing applied.
        let mut staged = MemoryState {
            hashes: writes
                .iter()
                .filter_map(|w| match w {
                    Write::Incr { key, .. } => state.hashes.get(key).map(|h| (key.clone(), h.clone())),
                    _ => None,
                })
                .collect(),
            versions: HashMap::new(),
        };
        for write in writes.iter().filter(|w| matches!(w, Write::Incr { .. })) {
            apply(&mut staged, write)?;
        }
        for write in writes {
            apply(&mut state, write)?;
        }
        Ok(true)
    }

    async fn del(&mut self, key: &str) -> NativeResult<u64> {
        let mut state = self.state.lock();
        let existed = state.hashes.remove(key).is_some();
        state.touch(key);
        Ok(u64::from(existed))
    }

    async fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> NativeResult<(u64, Vec<String>)> {
        let state = self.state.lock();
        let start = usize::try_from(cursor).unwrap_or(usize::MAX);
        let window: Vec<&String> = state.hashes.keys().skip(start).take(count.max(1)).collect();
        let end = start + window.len();
        let next = if end >= state.hashes.len() { 0 } else { end as u64 };
        let keys = window.into_iter().filter(|k| glob_match(pattern, k)).cloned().collect();
        Ok((next, keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("users:*", "users:1"));
        assert!(glob_match("m:a\\*b:*", "m:a*b:7"));
        assert!(!glob_match("m:a\\*b:*", "m:axb:7"));
        assert!(glob_match("t:?:x", "t:1:x"));
        assert!(!glob_match("users:*", "user:1"));
        assert_eq!(glob_escape("a*b?"), "a\\*b\\?");
    }

    #[tokio::test]
    async fn test_watch_aborts_on_concurrent_write() {
        let redis = MemoryRedis::new();
        let mut a = redis.connect();
        let mut b = redis.connect();
        a.watch("k").await.unwrap();
        b.exec(&[Write::Set { key: "k".into(), fields: vec![("f".into(), "1".into())] }]).await.unwrap();
        let ok = a.exec(&[Write::Set { key: "k".into(), fields: vec![("f".into(), "2".into())] }]).await.unwrap();
        assert!(!ok);
        assert_eq!(a.hgetall("k").await.unwrap()["f"], "1");
    }

    #[tokio::test]
    async fn test_scan_walks_every_key() {
        let redis = MemoryRedis::new();
        let mut c = redis.connect();
        for i in 0..10 {
            c.exec(&[Write::Set { key: format!("t:{i}"), fields: vec![("id".into(), i.to_string())] }])
                .await
                .unwrap();
        }
        c.exec(&[Write::Set { key: "other:1".into(), fields: vec![("id".into(), "1".into())] }]).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = c.scan(cursor, "t:*", 3).await.unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_incr_on_text_fails_atomically() {
        let redis = MemoryRedis::new();
        let mut c = redis.connect();
        c.exec(&[Write::Set { key: "k".into(), fields: vec![("name".into(), "x".into())] }]).await.unwrap();
        let err = c
            .exec(&[
                Write::Set { key: "k".into(), fields: vec![("other".into(), "y".into())] },
                Write::Incr { key: "k".into(), field: "name".into(), by: Value::from(1) },
            ])
            .await;
        assert!(err.is_err());
        assert!(!c.hgetall("k").await.unwrap().contains_key("other"));
    }
}
