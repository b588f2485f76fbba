// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis adapter: one hash per record at `table:k1:k2`.
//!
//! Hash values are strings; reads decode them with the declared column
//! types. `select` walks the keyspace with `SCAN ... MATCH table:prefix*`,
//! loads each hash and filters in memory. The continuation token is the
//! SCAN cursor, or `"cursor:skip"` when a page filled up in the middle of a
//! SCAN batch.
//!
//! `add` and `update` are optimistic transactions: `WATCH` the key, read it,
//! decide, then `MULTI`/`EXEC`. A concurrent write aborts the `EXEC` and the
//! check is repeated.

mod native;

pub use native::{glob_escape, glob_match, MemoryRedis, MemoryRedisConn, NativeResult, RedisNative, ServerRedis, Write};

use std::collections::HashMap;

use async_trait::async_trait;
use ::redis::RedisError;
use serde_json::Value;
use tracing::debug;

use super::{list_by_get, Adapter};
use crate::config::PoolConfig;
use crate::emulation::{self, join_key, key_part};
use crate::error::{DbError, Result};
use crate::request::{Capabilities, Op, PreparedRequest, QueryInfo, QueryResult, Row};
use crate::schema::{TableInfo, TableSpec};

/// Hash holding table definitions (field = table name).
const META_KEY: &str = "{polystore}:tables";

/// SCAN `COUNT` hint per round trip.
const SCAN_COUNT: usize = 100;

/// Attempts at an optimistic transaction before giving up.
const MAX_ATTEMPTS: usize = 5;

enum Backend {
    Server(::redis::Client),
    Memory(MemoryRedis),
}

pub struct RedisAdapter {
    backend: Backend,
}

type Client = Box<dyn RedisNative>;

impl RedisAdapter {
    /// Adapter over an in-process keyspace.
    #[must_use]
    pub fn memory(redis: MemoryRedis) -> Self {
        Self { backend: Backend::Memory(redis) }
    }

    /// `redis://` URLs connect to a server; an empty URL or `memory://` uses
    /// an in-process keyspace.
    pub fn from_config(cfg: &PoolConfig) -> Result<Self> {
        if cfg.url.is_empty() || cfg.url.starts_with("memory:") {
            return Ok(Self::memory(MemoryRedis::new()));
        }
        let client = ::redis::Client::open(cfg.url.as_str()).map_err(|e| DbError::connect("redis", e))?;
        Ok(Self { backend: Backend::Server(client) })
    }

    fn row_key(req: &PreparedRequest, row: &Row) -> String {
        format!("{}:{}", req.table, join_key(&req.keys_of(row), ':'))
    }

    fn decode(info: &TableInfo, hash: HashMap<String, String>) -> Row {
        hash.into_iter()
            .map(|(field, raw)| {
                let value = match info.column_type(&field) {
                    Some(kind) => kind.decode_text(&raw),
                    None => Value::String(raw),
                };
                (field, value)
            })
            .collect()
    }

    /// Split a row into fields to set and fields to remove (nulls).
    fn encode(row: &Row) -> (Vec<(String, String)>, Vec<String>) {
        let mut set = Vec::new();
        let mut removed = Vec::new();
        for (field, value) in row {
            match value {
                Value::Null => removed.push(field.clone()),
                other => set.push((field.clone(), key_part(other))),
            }
        }
        (set, removed)
    }

    fn writes_for(key: &str, row: &Row) -> Vec<Write> {
        let (fields, removed) = Self::encode(row);
        let mut writes = Vec::new();
        if !fields.is_empty() {
            writes.push(Write::Set { key: key.to_string(), fields });
        }
        writes.extend(removed.into_iter().map(|field| Write::DelField { key: key.to_string(), field }));
        writes
    }

    async fn get(&self, client: &mut Client, req: &PreparedRequest) -> Result<Option<Row>> {
        let key = Self::row_key(req, &req.object);
        let hash = client.hgetall(&key).await.map_err(|e| self.convert_error(req, e))?;
        Ok((!hash.is_empty()).then(|| Self::decode(&req.info, hash)))
    }

    async fn add(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        let key = Self::row_key(req, &req.object);
        let writes = Self::writes_for(&key, &req.object);
        for _ in 0..MAX_ATTEMPTS {
            client.watch(&key).await.map_err(|e| self.convert_error(req, e))?;
            let existing = client.hgetall(&key).await.map_err(|e| self.convert_error(req, e))?;
            if !existing.is_empty() {
                client.unwatch().await.map_err(|e| self.convert_error(req, e))?;
                return Err(DbError::AlreadyExists { table: req.table.clone() });
            }
            if client.exec(&writes).await.map_err(|e| self.convert_error(req, e))? {
                return Ok(QueryResult::affected(1));
            }
            debug!(key = %key, "add raced with another writer");
        }
        Err(DbError::AlreadyExists { table: req.table.clone() })
    }

    async fn put(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        let key = Self::row_key(req, &req.object);
        let mut writes = vec![Write::Del { key: key.clone() }];
        writes.extend(Self::writes_for(&key, &req.object).into_iter().filter(|w| !matches!(w, Write::DelField { .. })));
        client.exec(&writes).await.map_err(|e| self.convert_error(req, e))?;
        Ok(QueryResult::affected(1))
    }

    async fn update(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        let key = Self::row_key(req, &req.object);
        let writes = Self::writes_for(&key, &req.data());
        if writes.is_empty() {
            return Ok(QueryResult::affected(0));
        }
        for _ in 0..MAX_ATTEMPTS {
            client.watch(&key).await.map_err(|e| self.convert_error(req, e))?;
            let hash = client.hgetall(&key).await.map_err(|e| self.convert_error(req, e))?;
            let current = Self::decode(&req.info, hash);
            let stale = req.options.expected.as_ref().is_some_and(|e| !emulation::matches_expected(&current, e));
            if current.is_empty() || stale {
                client.unwatch().await.map_err(|e| self.convert_error(req, e))?;
                return Ok(QueryResult::affected(0));
            }
            if client.exec(&writes).await.map_err(|e| self.convert_error(req, e))? {
                return Ok(QueryResult::affected(1));
            }
            debug!(key = %key, "update raced with another writer, re-checking");
        }
        Ok(QueryResult::affected(0))
    }

    async fn incr(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        let key = Self::row_key(req, &req.object);
        let mut writes = Self::writes_for(&key, &req.key_row());
        writes.extend(
            req.data()
                .into_iter()
                .map(|(field, by)| Write::Incr { key: key.clone(), field, by }),
        );
        client.exec(&writes).await.map_err(|e| self.convert_error(req, e))?;
        Ok(QueryResult::affected(1))
    }

    fn scan_pattern(req: &PreparedRequest) -> String {
        let (fixed, tail) = req.key_prefix();
        let mut pattern = format!("{}:", glob_escape(&req.table));
        let fixed: Vec<String> = fixed.iter().map(|v| glob_escape(&key_part(v))).collect();
        pattern.push_str(&fixed.join(":"));
        if let Some(tail) = tail {
            if !fixed.is_empty() {
                pattern.push(':');
            }
            let value = key_part(&tail.value);
            pattern.push_str(&glob_escape(value.strip_suffix('%').unwrap_or(&value)));
        } else if !fixed.is_empty() {
            pattern.push(':');
        }
        pattern.push('*');
        pattern
    }

    async fn select(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        let (fixed, _) = req.key_prefix();
        if !req.keys.is_empty() && fixed.len() == req.keys.len() {
            let mut exact = req.clone();
            exact.object = req.keys.iter().cloned().zip(fixed).collect();
            let rows = self.get(client, &exact).await?.into_iter().filter(|r| req.full_filter().matches(r)).collect();
            return Ok(QueryResult::rows(req.finish(rows)));
        }

        let (mut cursor, mut skip) = parse_token(req.start.as_ref())?;
        let pattern = Self::scan_pattern(req);
        let filter = req.full_filter();
        let mut rows = Vec::new();
        let mut token = None;

        'scan: loop {
            let (next, keys) = client
                .scan(cursor, &pattern, SCAN_COUNT)
                .await
                .map_err(|e| self.convert_error(req, e))?;
            let total = keys.len();
            for (i, key) in keys.into_iter().enumerate().skip(skip) {
                let hash = client.hgetall(&key).await.map_err(|e| self.convert_error(req, e))?;
                if hash.is_empty() {
                    continue;
                }
                let row = Self::decode(&req.info, hash);
                if !filter.matches(&row) {
                    continue;
                }
                rows.push(row);
                if req.page_full(rows.len()) {
                    token = if i + 1 < total {
                        Some(Value::String(format!("{cursor}:{}", i + 1)))
                    } else if next != 0 {
                        Some(Value::from(next))
                    } else {
                        None
                    };
                    break 'scan;
                }
            }
            skip = 0;
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(QueryResult {
            rows: req.finish(rows),
            info: QueryInfo { next_token: token, ..Default::default() },
        })
    }

    async fn schema_op(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        match req.op {
            Op::Create | Op::Upgrade => {
                let current = client.hgetall(META_KEY).await.map_err(|e| self.convert_error(req, e))?;
                let mut spec: TableSpec = match current.get(&req.table) {
                    Some(raw) => serde_json::from_str(raw).map_err(|e| DbError::backend_code("redis", "codec", e, false))?,
                    None => TableSpec::new(),
                };
                let incoming: TableSpec = serde_json::from_value(Value::Object(req.object.clone()))
                    .map_err(|e| DbError::invalid(e.to_string()))?;
                spec.columns.extend(incoming.columns);
                let raw = serde_json::to_string(&spec).map_err(|e| DbError::invalid(e.to_string()))?;
                let write = Write::Set { key: META_KEY.to_string(), fields: vec![(req.table.clone(), raw)] };
                client.exec(&[write]).await.map_err(|e| self.convert_error(req, e))?;
                Ok(QueryResult::affected(0))
            }
            _ => {
                let pattern = format!("{}:*", glob_escape(&req.table));
                let mut cursor = 0;
                let mut removed = 0;
                loop {
                    let (next, keys) = client
                        .scan(cursor, &pattern, SCAN_COUNT)
                        .await
                        .map_err(|e| self.convert_error(req, e))?;
                    for key in keys {
                        removed += client.del(&key).await.map_err(|e| self.convert_error(req, e))?;
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                let write = Write::DelField { key: META_KEY.to_string(), field: req.table.clone() };
                client.exec(&[write]).await.map_err(|e| self.convert_error(req, e))?;
                Ok(QueryResult::affected(removed))
            }
        }
    }
}

/// `N` or `"N:skip"`.
fn parse_token(start: Option<&Value>) -> Result<(u64, usize)> {
    let invalid = || DbError::invalid("invalid redis scan token");
    match start {
        None => Ok((0, 0)),
        Some(Value::Number(n)) => n.as_u64().map(|c| (c, 0)).ok_or_else(invalid),
        Some(Value::String(s)) => {
            let (cursor, skip) = s.split_once(':').unwrap_or((s.as_str(), "0"));
            Ok((cursor.parse().map_err(|_| invalid())?, skip.parse().map_err(|_| invalid())?))
        }
        Some(_) => Err(invalid()),
    }
}

#[async_trait]
impl Adapter for RedisAdapter {
    type Client = Client;
    type NativeError = RedisError;

    fn kind(&self) -> &'static str {
        "redis"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::KEYED
    }

    async fn open(&self) -> Result<Client> {
        match &self.backend {
            Backend::Server(client) => {
                let conn = ServerRedis::connect(client).await.map_err(|e| DbError::connect("redis", e))?;
                Ok(Box::new(conn))
            }
            Backend::Memory(redis) => Ok(Box::new(redis.connect())),
        }
    }

    async fn query(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        match req.op {
            Op::Get => {
                let rows = self.get(client, req).await?.into_iter().collect();
                Ok(QueryResult::rows(req.finish(rows)))
            }
            Op::Select => self.select(client, req).await,
            Op::List => list_by_get(self, client, req).await,
            Op::Add => self.add(client, req).await,
            Op::Put => self.put(client, req).await,
            Op::Update => self.update(client, req).await,
            Op::Incr => self.incr(client, req).await,
            Op::Del => {
                let key = Self::row_key(req, &req.object);
                let n = client.del(&key).await.map_err(|e| self.convert_error(req, e))?;
                Ok(QueryResult::affected(n))
            }
            Op::Create | Op::Upgrade | Op::Drop => self.schema_op(client, req).await,
        }
    }

    async fn cache_columns(&self, client: &mut Client) -> Result<HashMap<String, TableInfo>> {
        let meta = client.hgetall(META_KEY).await.map_err(|e| DbError::backend("redis", e))?;
        let mut tables = HashMap::new();
        for (table, raw) in meta {
            let spec: TableSpec = serde_json::from_str(&raw).map_err(|e| DbError::backend_code("redis", "codec", e, false))?;
            tables.insert(table, spec.to_info());
        }
        Ok(tables)
    }

    fn next_token(&self, _req: &PreparedRequest, _rows: &[Row]) -> Option<Value> {
        None
    }

    fn convert_error(&self, _req: &PreparedRequest, err: RedisError) -> DbError {
        let transient = err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || matches!(err.code(), Some("BUSY" | "LOADING" | "TRYAGAIN" | "MASTERDOWN"));
        let code = err.code().map_or_else(|| format!("{:?}", err.kind()), str::to_string);
        DbError::backend_code("redis", code, err, transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{prepare, FieldOp, Request};
    use crate::schema::ColumnType;
    use serde_json::json;
    use std::sync::Arc;

    fn messages() -> Arc<TableInfo> {
        Arc::new(
            TableSpec::new()
                .primary("account_id", ColumnType::Text)
                .primary("mtime", ColumnType::Int)
                .column("status", ColumnType::Text)
                .column("hits", ColumnType::Counter)
                .to_info(),
        )
    }

    async fn run(a: &RedisAdapter, client: &mut Client, req: Request) -> Result<QueryResult> {
        let p = prepare(&req, messages(), &a.capabilities())?;
        a.query(client, &p).await
    }

    #[tokio::test]
    async fn test_add_existing_is_an_error_and_put_overwrites() {
        let a = RedisAdapter::memory(MemoryRedis::new());
        let mut c = a.open().await.unwrap();
        let row = json!({"account_id": "a", "mtime": 1, "status": "new"});
        run(&a, &mut c, Request::new(Op::Add, "messages", row.clone())).await.unwrap();

        let dup = run(&a, &mut c, Request::new(Op::Add, "messages", row)).await;
        assert!(matches!(dup, Err(DbError::AlreadyExists { .. })));

        run(&a, &mut c, Request::new(Op::Put, "messages", json!({"account_id": "a", "mtime": 1, "status": "old"})))
            .await
            .unwrap();
        let got = run(&a, &mut c, Request::new(Op::Get, "messages", json!({"account_id": "a", "mtime": 1})))
            .await
            .unwrap();
        assert_eq!(Value::Object(got.rows[0].clone()), json!({"account_id": "a", "mtime": 1, "status": "old"}));
    }

    #[tokio::test]
    async fn test_expected_update_and_incr() {
        let a = RedisAdapter::memory(MemoryRedis::new());
        let mut c = a.open().await.unwrap();
        run(&a, &mut c, Request::new(Op::Add, "messages", json!({"account_id": "a", "mtime": 1, "status": "new"})))
            .await
            .unwrap();

        let stale = Request::new(Op::Update, "messages", json!({"account_id": "a", "mtime": 1, "status": "x"}))
            .expected(json!({"status": "old"}));
        assert_eq!(run(&a, &mut c, stale).await.unwrap().affected_rows(), 0);
        let fresh = Request::new(Op::Update, "messages", json!({"account_id": "a", "mtime": 1, "status": "x"}))
            .expected(json!({"status": "new"}));
        assert_eq!(run(&a, &mut c, fresh).await.unwrap().affected_rows(), 1);

        let missing = Request::new(Op::Update, "messages", json!({"account_id": "zz", "mtime": 1, "status": "x"}));
        assert_eq!(run(&a, &mut c, missing).await.unwrap().affected_rows(), 0);

        for _ in 0..3 {
            run(&a, &mut c, Request::new(Op::Incr, "messages", json!({"account_id": "a", "mtime": 1, "hits": 2})))
                .await
                .unwrap();
        }
        let got = run(&a, &mut c, Request::new(Op::Get, "messages", json!({"account_id": "a", "mtime": 1})))
            .await
            .unwrap();
        assert_eq!(got.rows[0]["hits"], json!(6));
        assert_eq!(got.rows[0]["status"], json!("x"));
    }

    #[tokio::test]
    async fn test_scan_pagination_is_complete() {
        let a = RedisAdapter::memory(MemoryRedis::new());
        let mut c = a.open().await.unwrap();
        for account in ["a", "b"] {
            for mtime in 0..40 {
                let status = if mtime % 2 == 0 { "even" } else { "odd" };
                let row = json!({"account_id": account, "mtime": mtime, "status": status});
                run(&a, &mut c, Request::new(Op::Add, "messages", row)).await.unwrap();
            }
        }

        let mut token = None;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let req = Request::new(Op::Select, "messages", json!({"account_id": "a", "status": "odd"}))
                .count(7)
                .start(token.clone());
            let res = run(&a, &mut c, req).await.unwrap();
            assert!(res.rows.len() <= 7);
            seen.extend(res.rows.iter().map(|r| r["mtime"].as_i64().unwrap()));
            pages += 1;
            token = res.info.next_token;
            if token.is_none() {
                break;
            }
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 20);
        assert!(pages >= 3);
    }

    #[tokio::test]
    async fn test_key_prefix_select_and_sort() {
        let a = RedisAdapter::memory(MemoryRedis::new());
        let mut c = a.open().await.unwrap();
        for mtime in [5, 15, 25, 150] {
            run(&a, &mut c, Request::new(Op::Add, "messages", json!({"account_id": "a", "mtime": mtime})))
                .await
                .unwrap();
        }
        let req = Request::new(Op::Select, "messages", json!({"account_id": "a", "mtime": "1"}))
            .with_op("mtime", FieldOp::BeginsWith)
            .sort("mtime", true);
        let res = run(&a, &mut c, req).await.unwrap();
        let got: Vec<i64> = res.rows.iter().map(|r| r["mtime"].as_i64().unwrap()).collect();
        assert_eq!(got, vec![150, 15]);
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token(None).unwrap(), (0, 0));
        assert_eq!(parse_token(Some(&json!(17))).unwrap(), (17, 0));
        assert_eq!(parse_token(Some(&json!("17:4"))).unwrap(), (17, 4));
        assert!(parse_token(Some(&json!("x"))).is_err());
    }
}
