// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend adapters.
//!
//! Each adapter implements [`Adapter`] for one storage engine: it opens and
//! closes native clients, translates a [`PreparedRequest`] into native
//! calls, returns normalized rows and maps native errors onto [`DbError`].
//! Adapters are selected by kind string through [`AdapterRegistry`].
//!
//! | Kind | Native filter | Sort | Token |
//! |---|---|---|---|
//! | `sqlite`, `mysql`, `postgres`, `sql` | any column | native | row offset |
//! | `cassandra` | partition + clustering key | 2nd key column | last key tuple |
//! | `mongodb` | any field | native | skip offset |
//! | `couchdb` | view key | view order | last view key |
//! | `redis` | joined key glob | emulated | SCAN cursor |
//! | `riak` | `pk_bin` 2i range | emulated | continuation |
//! | `lmdb`, `memory` | key prefix | emulated | last key |
//! | `none` | - | - | - |

pub mod cassandra;
pub mod couch;
pub mod kv;
pub mod mongo;
pub mod none;
pub mod redis;
pub mod riak;
pub mod sql;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::config::PoolConfig;
use crate::error::{DbError, Result};
use crate::pool::{Engine, Managed};
use crate::request::{Capabilities, Op, PreparedRequest, QueryResult, Row};
use crate::schema::TableInfo;

/// Common contract of every backend.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Opaque native client, owned by the pool while idle.
    type Client: Send + 'static;
    /// Error type of the native client library.
    type NativeError: Send;

    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    async fn open(&self) -> Result<Self::Client>;

    fn close(&self, client: Self::Client) {
        drop(client);
    }

    /// Clear per-session state before the client is reused.
    fn reset(&self, _client: &mut Self::Client) -> bool {
        true
    }

    async fn query(&self, client: &mut Self::Client, req: &PreparedRequest) -> Result<QueryResult>;

    /// Introspect every table: `dbcolumns`, `dbkeys`, `dbindexes`.
    async fn cache_columns(&self, client: &mut Self::Client) -> Result<HashMap<String, TableInfo>>;

    /// Continuation for a page of `rows`, when the adapter did not set one
    /// from native state. Defaults to a row offset.
    fn next_token(&self, req: &PreparedRequest, rows: &[Row]) -> Option<Value> {
        offset_token(req, rows)
    }

    fn convert_error(&self, req: &PreparedRequest, err: Self::NativeError) -> DbError;
}

/// Offset a paged read resumes from (`options.start` as an integer).
pub fn start_offset(req: &PreparedRequest) -> Result<usize> {
    match &req.start {
        None => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| DbError::invalid("start offset must be a non-negative integer")),
        Some(Value::String(s)) => s
            .parse::<usize>()
            .map_err(|_| DbError::invalid(format!("invalid start offset '{s}'"))),
        Some(other) => Err(DbError::invalid(format!("invalid start offset {other}"))),
    }
}

/// Token for offset-paginated backends: next offset when the page is full.
#[must_use]
pub fn offset_token(req: &PreparedRequest, rows: &[Row]) -> Option<Value> {
    if !req.page_full(rows.len()) {
        return None;
    }
    let offset = start_offset(req).unwrap_or(0);
    Some(Value::from(offset + rows.len()))
}

/// `list` for adapters without a native multi-get: one `get` per key.
pub async fn list_by_get<A: Adapter>(
    adapter: &A,
    client: &mut A::Client,
    req: &PreparedRequest,
) -> Result<QueryResult> {
    let mut rows = Vec::with_capacity(req.list.len());
    for key in &req.list {
        let mut get = req.clone();
        get.op = Op::Get;
        get.object = key.clone();
        get.list = Vec::new();
        let result = adapter.query(client, &get).await?;
        rows.extend(result.rows);
    }
    Ok(QueryResult::rows(rows))
}

/// Builds the engine for one pool configuration.
pub type Constructor = Arc<dyn Fn(&PoolConfig) -> Result<Arc<dyn Engine>> + Send + Sync>;

/// Kind string → adapter constructor.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    kinds: HashMap<String, Constructor>,
}

impl AdapterRegistry {
    /// Empty registry; see [`builtin`](Self::builtin).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adapter shipped with the crate.
    #[must_use]
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        for kind in ["sqlite", "mysql", "postgres", "sql"] {
            reg.register(kind, |cfg| Ok(Managed::engine(cfg, sql::SqlAdapter::from_config(cfg)?)));
        }
        reg.register("redis", |cfg| Ok(Managed::engine(cfg, redis::RedisAdapter::from_config(cfg)?)));
        reg.register("cassandra", |cfg| {
            Ok(Managed::engine(cfg, cassandra::CassandraAdapter::from_config(cfg)?))
        });
        reg.register("mongodb", |cfg| Ok(Managed::engine(cfg, mongo::MongoAdapter::from_config(cfg)?)));
        reg.register("couchdb", |cfg| Ok(Managed::engine(cfg, couch::CouchAdapter::from_config(cfg)?)));
        reg.register("riak", |cfg| Ok(Managed::engine(cfg, riak::RiakAdapter::from_config(cfg)?)));
        reg.register("lmdb", |cfg| Ok(Managed::engine(cfg, kv::KvAdapter::lmdb(cfg)?)));
        reg.register("memory", |cfg| Ok(Managed::engine(cfg, kv::KvAdapter::memory(cfg))));
        reg.register("none", |cfg| Ok(Managed::engine(cfg, none::NoneAdapter)));
        reg
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&PoolConfig) -> Result<Arc<dyn Engine>> + Send + Sync + 'static,
    {
        self.kinds.insert(kind.to_lowercase(), Arc::new(constructor));
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(&kind.to_lowercase())
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.kinds.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Build the engine for `cfg`. Unknown kinds get the no-op engine so a
    /// misconfigured pool answers with empty results instead of failing.
    pub fn build(&self, cfg: &PoolConfig) -> Result<Arc<dyn Engine>> {
        match self.kinds.get(&cfg.kind.to_lowercase()) {
            Some(constructor) => constructor(cfg),
            None => {
                warn!(pool = %cfg.name, kind = %cfg.kind, "unknown adapter kind, using none");
                Ok(Managed::engine(cfg, none::NoneAdapter))
            }
        }
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").field("kinds", &self.kinds()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{prepare, Request};
    use serde_json::json;

    #[test]
    fn test_builtin_kinds() {
        let reg = AdapterRegistry::builtin();
        for kind in ["sqlite", "redis", "cassandra", "mongodb", "couchdb", "riak", "lmdb", "memory", "none"] {
            assert!(reg.contains(kind), "{kind} missing");
        }
        assert!(reg.contains("REDIS"));
    }

    #[tokio::test]
    async fn test_unknown_kind_builds_none_engine() {
        let reg = AdapterRegistry::builtin();
        let engine = reg.build(&PoolConfig::new("x", "oracle")).unwrap();
        assert_eq!(engine.kind(), "none");
    }

    #[test]
    fn test_offset_token_only_for_full_pages() {
        let info = Arc::new(TableInfo::unknown());
        let req = Request::new(Op::Select, "t", json!({})).count(2).start(Some(json!(4)));
        let p = prepare(&req, info, &Capabilities::NATIVE).unwrap();
        let rows = vec![Row::new(), Row::new()];
        assert_eq!(offset_token(&p, &rows), Some(json!(6)));
        assert_eq!(offset_token(&p, &rows[..1]), None);
    }

    #[test]
    fn test_bad_offset_is_invalid_input() {
        let info = Arc::new(TableInfo::unknown());
        let req = Request::new(Op::Select, "t", json!({})).start(Some(json!("abc")));
        let p = prepare(&req, info, &Capabilities::NATIVE).unwrap();
        assert!(matches!(start_offset(&p), Err(DbError::InvalidInput(_))));
    }
}
