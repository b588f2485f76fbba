// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered key/value adapter (`lmdb`, `memory`).
//!
//! Rows are JSON documents stored under `table SEP k1 SEP k2 ...` where
//! `SEP` is [`KEY_SEP`], so key order inside a table is tuple order of the
//! primary key. Table definitions live under `META table`, which sorts
//! before every data key.
//!
//! `select` narrows with a prefix scan built from the leading `eq` key
//! conditions, re-checks every predicate in memory and keeps scanning until
//! the page is full. The continuation token is the last key returned; the
//! next scan starts strictly after it.

mod lmdb;
mod memory;

pub use lmdb::LmdbKv;
pub use memory::MemoryKv;

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::{list_by_get, Adapter};
use crate::config::PoolConfig;
use crate::emulation::{self, join_key, KEY_SEP};
use crate::error::{DbError, Result};
use crate::request::{Capabilities, Op, PreparedRequest, QueryInfo, QueryResult, Row};
use crate::schema::{TableInfo, TableSpec};

/// Prefix of table definition records.
const META: char = '\u{0}';

/// Rows read per native scan while filling a page.
const SCAN_BATCH: usize = 256;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("lmdb: {0}")]
    Lmdb(#[from] heed::Error),

    #[error("corrupt record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a read-modify-write callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Keep,
    Put(Vec<u8>),
    Delete,
}

/// Sorted byte store with atomic single-key read-modify-write.
pub trait OrderedKv: Send + Sync + 'static {
    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, KvError>;

    fn modify(&self, key: &str, f: &mut dyn FnMut(Option<&[u8]>) -> Change) -> std::result::Result<(), KvError>;

    /// Up to `limit` entries whose key starts with `prefix`, strictly after
    /// `after` in scan direction.
    fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
        reverse: bool,
    ) -> std::result::Result<Vec<(String, Vec<u8>)>, KvError>;

    fn delete_prefix(&self, prefix: &str) -> std::result::Result<usize, KvError>;
}

/// Range bounds covering `prefix`, resuming after `after`.
pub(crate) fn scan_bounds(prefix: &str, after: Option<&str>, reverse: bool) -> (Bound<String>, Bound<String>) {
    let end = format!("{prefix}{}", char::MAX);
    let after = after.filter(|a| a.starts_with(prefix));
    match (reverse, after) {
        (false, Some(a)) => (Bound::Excluded(a.to_string()), Bound::Excluded(end)),
        (false, None) => (Bound::Included(prefix.to_string()), Bound::Excluded(end)),
        (true, Some(a)) => (Bound::Included(prefix.to_string()), Bound::Excluded(a.to_string())),
        (true, None) => (Bound::Included(prefix.to_string()), Bound::Excluded(end)),
    }
}

pub(crate) fn borrowed(bound: &Bound<String>) -> Bound<&str> {
    match bound {
        Bound::Included(s) => Bound::Included(s.as_str()),
        Bound::Excluded(s) => Bound::Excluded(s.as_str()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn table_prefix(table: &str) -> String {
    format!("{table}{KEY_SEP}")
}

fn meta_key(table: &str) -> String {
    format!("{META}{table}")
}

fn encode(row: &Row) -> std::result::Result<Vec<u8>, KvError> {
    Ok(serde_json::to_vec(row)?)
}

fn decode(bytes: &[u8]) -> std::result::Result<Row, KvError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub struct KvAdapter {
    kind: &'static str,
    store: Arc<dyn OrderedKv>,
}

impl KvAdapter {
    pub fn new(kind: &'static str, store: Arc<dyn OrderedKv>) -> Self {
        Self { kind, store }
    }

    /// In-process store, shared by every client of the pool.
    #[must_use]
    pub fn memory(_cfg: &PoolConfig) -> Self {
        Self::new("memory", Arc::new(MemoryKv::new()))
    }

    /// LMDB environment at the pool URL (`lmdb:///path` or a plain path).
    pub fn lmdb(cfg: &PoolConfig) -> Result<Self> {
        let path = cfg.url.strip_prefix("lmdb://").unwrap_or(&cfg.url);
        if path.is_empty() {
            return Err(DbError::invalid(format!("lmdb pool '{}' needs a directory url", cfg.name)));
        }
        let map_size = cfg
            .options
            .get("map_size")
            .and_then(Value::as_u64)
            .map_or(lmdb::DEFAULT_MAP_SIZE, |n| n as usize);
        let store = LmdbKv::open(path, map_size).map_err(|e| DbError::connect("lmdb", e))?;
        Ok(Self::new("lmdb", Arc::new(store)))
    }

    fn row_key(&self, req: &PreparedRequest, values: &[Value]) -> String {
        format!("{}{}", table_prefix(&req.table), join_key(values, KEY_SEP))
    }

    fn write(&self, req: &PreparedRequest) -> Result<QueryResult> {
        let key = self.row_key(req, &req.key_values());
        let data = req.data();
        let expected = req.options.expected.clone();
        let mut affected = 0u64;
        let mut exists = false;
        let mut codec_error = None;
        let mut encode_error = None;

        self.store
            .modify(&key, &mut |current| {
                let current = match current.map(decode).transpose() {
                    Ok(row) => row,
                    Err(e) => {
                        codec_error = Some(e);
                        return Change::Keep;
                    }
                };
                match (req.op, current) {
                    (Op::Add, Some(_)) => {
                        exists = true;
                        Change::Keep
                    }
                    (Op::Add | Op::Put, _) => put_row(encode(&req.object), &mut affected, &mut encode_error),
                    (Op::Update, None) => Change::Keep,
                    (Op::Update, Some(mut row)) => {
                        if expected.as_ref().is_some_and(|e| !emulation::matches_expected(&row, e)) {
                            return Change::Keep;
                        }
                        emulation::merge_row(&mut row, &data, false);
                        put_row(encode(&row), &mut affected, &mut encode_error)
                    }
                    (Op::Incr, current) => {
                        let mut row = current.unwrap_or_else(|| req.key_row());
                        emulation::merge_row(&mut row, &data, true);
                        put_row(encode(&row), &mut affected, &mut encode_error)
                    }
                    (Op::Del, Some(_)) => {
                        affected = 1;
                        Change::Delete
                    }
                    _ => Change::Keep,
                }
            })
            .map_err(|e| self.convert_error(req, e))?;

        if let Some(e) = codec_error {
            return Err(self.convert_error(req, e));
        }
        if let Some(e) = encode_error {
            return Err(DbError::invalid(format!("cannot encode row for '{}': {e}", req.table)));
        }
        if exists {
            return Err(DbError::AlreadyExists { table: req.table.clone() });
        }
        Ok(QueryResult::affected(affected))
    }

    fn select(&self, req: &PreparedRequest) -> Result<QueryResult> {
        let (fixed, tail) = req.key_prefix();
        let mut prefix = table_prefix(&req.table);
        prefix.push_str(&join_key(&fixed, KEY_SEP));
        if let Some(tail) = tail {
            if !fixed.is_empty() {
                prefix.push(KEY_SEP);
            }
            let value = emulation::key_part(&tail.value);
            prefix.push_str(value.strip_suffix('%').unwrap_or(&value));
        } else if !fixed.is_empty() && fixed.len() < req.keys.len() {
            prefix.push(KEY_SEP);
        }

        let mut after = match &req.start {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => return Err(DbError::invalid(format!("invalid start key {other}"))),
        };
        let filter = req.full_filter();
        let wanted = req.count.filter(|c| *c > 0);
        let mut rows = Vec::new();
        let mut last_key = None;

        'fill: loop {
            let batch = self
                .store
                .scan(&prefix, after.as_deref(), SCAN_BATCH, req.options.desc)
                .map_err(|e| self.convert_error(req, e))?;
            let exhausted = batch.len() < SCAN_BATCH;
            for (key, bytes) in batch {
                let row = decode(&bytes).map_err(|e| self.convert_error(req, e))?;
                after = Some(key.clone());
                if filter.matches(&row) {
                    rows.push(row);
                    if wanted.is_some_and(|w| rows.len() >= w) {
                        last_key = Some(key);
                        break 'fill;
                    }
                }
            }
            if exhausted {
                break;
            }
        }

        Ok(QueryResult {
            rows: req.finish(rows),
            info: QueryInfo { next_token: last_key.map(Value::String), ..Default::default() },
        })
    }

    fn schema_op(&self, req: &PreparedRequest) -> Result<QueryResult> {
        let meta = meta_key(&req.table);
        match req.op {
            Op::Create | Op::Upgrade => {
                let incoming: TableSpec = serde_json::from_value(Value::Object(req.object.clone()))
                    .map_err(|e| DbError::invalid(e.to_string()))?;
                let mut codec_error = None;
                self.store
                    .modify(&meta, &mut |current| {
                        let mut spec: TableSpec = match current.map(serde_json::from_slice).transpose() {
                            Ok(spec) => spec.unwrap_or_default(),
                            Err(e) => {
                                codec_error = Some(KvError::Codec(e));
                                return Change::Keep;
                            }
                        };
                        spec.columns.extend(incoming.columns.clone());
                        match serde_json::to_vec(&spec) {
                            Ok(bytes) => Change::Put(bytes),
                            Err(e) => {
                                codec_error = Some(KvError::Codec(e));
                                Change::Keep
                            }
                        }
                    })
                    .map_err(|e| self.convert_error(req, e))?;
                if let Some(e) = codec_error {
                    return Err(self.convert_error(req, e));
                }
                Ok(QueryResult::affected(0))
            }
            _ => {
                let removed = self
                    .store
                    .delete_prefix(&table_prefix(&req.table))
                    .map_err(|e| self.convert_error(req, e))?;
                self.store
                    .modify(&meta, &mut |_| Change::Delete)
                    .map_err(|e| self.convert_error(req, e))?;
                Ok(QueryResult::affected(removed as u64))
            }
        }
    }
}

/// Store an encoded row; an encoding failure keeps the old value and is
/// reported through `failed`.
fn put_row(encoded: std::result::Result<Vec<u8>, KvError>, affected: &mut u64, failed: &mut Option<KvError>) -> Change {
    match encoded {
        Ok(bytes) => {
            *affected = 1;
            Change::Put(bytes)
        }
        Err(e) => {
            *failed = Some(e);
            Change::Keep
        }
    }
}

#[async_trait]
impl Adapter for KvAdapter {
    type Client = Arc<dyn OrderedKv>;
    type NativeError = KvError;

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::KEYED
    }

    async fn open(&self) -> Result<Self::Client> {
        Ok(self.store.clone())
    }

    async fn query(&self, client: &mut Self::Client, req: &PreparedRequest) -> Result<QueryResult> {
        match req.op {
            Op::Get => {
                let key = self.row_key(req, &req.key_values());
                let found = self.store.get(&key).map_err(|e| self.convert_error(req, e))?;
                let rows = match found {
                    Some(bytes) => vec![decode(&bytes).map_err(|e| self.convert_error(req, e))?],
                    None => Vec::new(),
                };
                Ok(QueryResult::rows(req.finish(rows)))
            }
            Op::Select => self.select(req),
            Op::List => list_by_get(self, client, req).await,
            Op::Add | Op::Put | Op::Update | Op::Incr | Op::Del => self.write(req),
            Op::Create | Op::Upgrade | Op::Drop => self.schema_op(req),
        }
    }

    async fn cache_columns(&self, _client: &mut Self::Client) -> Result<HashMap<String, TableInfo>> {
        let entries = self
            .store
            .scan(&META.to_string(), None, usize::MAX, false)
            .map_err(|e| DbError::backend(self.kind, e))?;
        let mut tables = HashMap::new();
        for (key, bytes) in entries {
            let spec: TableSpec = serde_json::from_slice(&bytes).map_err(|e| DbError::backend(self.kind, e))?;
            tables.insert(key.trim_start_matches(META).to_string(), spec.to_info());
        }
        Ok(tables)
    }

    fn next_token(&self, _req: &PreparedRequest, _rows: &[Row]) -> Option<Value> {
        None
    }

    fn convert_error(&self, _req: &PreparedRequest, err: KvError) -> DbError {
        match err {
            KvError::Lmdb(heed::Error::Io(e)) | KvError::Io(e) => {
                DbError::backend_code(self.kind, "io", e, true)
            }
            KvError::Lmdb(e) => DbError::backend_code(self.kind, "mdb", e, false),
            KvError::Codec(e) => DbError::backend_code(self.kind, "codec", e, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{prepare, FieldOp, Request};
    use crate::schema::ColumnType;
    use serde_json::json;

    fn adapter() -> KvAdapter {
        KvAdapter::memory(&PoolConfig::new("mem", "memory"))
    }

    fn messages() -> Arc<TableInfo> {
        Arc::new(
            TableSpec::new()
                .primary("account_id", ColumnType::Text)
                .primary("mtime", ColumnType::Int)
                .to_info(),
        )
    }

    async fn run(a: &KvAdapter, req: Request) -> Result<QueryResult> {
        let p = prepare(&req, messages(), &a.capabilities())?;
        let mut client = a.open().await?;
        a.query(&mut client, &p).await
    }

    async fn seed(a: &KvAdapter) {
        for account in ["a1", "a2"] {
            for mtime in 0..12 {
                let status = if mtime % 3 == 0 { "new" } else { "old" };
                run(a, Request::new(Op::Add, "messages", json!({
                    "account_id": account, "mtime": mtime, "status": status
                })))
                .await
                .unwrap();
            }
        }
    }

    #[test]
    fn test_put_row_reports_encode_failure() {
        let mut affected = 0;
        let mut failed = None;
        let broken = Err(KvError::Io(std::io::Error::other("unencodable")));
        assert!(matches!(put_row(broken, &mut affected, &mut failed), Change::Keep));
        assert_eq!(affected, 0);
        assert!(failed.is_some());

        let change = put_row(encode(&Row::new()), &mut affected, &mut failed);
        assert!(matches!(change, Change::Put(_)));
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn test_add_existing_fails_and_put_overwrites() {
        let a = adapter();
        seed(&a).await;
        let dup = run(&a, Request::new(Op::Add, "messages", json!({"account_id": "a1", "mtime": 1}))).await;
        assert!(matches!(dup, Err(DbError::AlreadyExists { .. })));

        run(&a, Request::new(Op::Put, "messages", json!({"account_id": "a1", "mtime": 1, "status": "x"})))
            .await
            .unwrap();
        let got = run(&a, Request::new(Op::Get, "messages", json!({"account_id": "a1", "mtime": 1}))).await.unwrap();
        assert_eq!(got.rows[0]["status"], json!("x"));
    }

    #[tokio::test]
    async fn test_paged_select_with_filter_is_complete() {
        let a = adapter();
        seed(&a).await;
        let mut token = None;
        let mut seen = Vec::new();
        loop {
            let req = Request::new(Op::Select, "messages", json!({"account_id": "a1", "status": "new"}))
                .count(3)
                .start(token.clone());
            let res = run(&a, req).await.unwrap();
            seen.extend(res.rows.iter().map(|r| r["mtime"].as_i64().unwrap()));
            token = res.info.next_token;
            if token.is_none() {
                break;
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 3, 6, 9]);
    }

    #[tokio::test]
    async fn test_descending_select() {
        let a = adapter();
        seed(&a).await;
        let mut req = Request::new(Op::Select, "messages", json!({"account_id": "a2"})).count(2);
        req.options.desc = true;
        let res = run(&a, req).await.unwrap();
        // keys compare as text: "9" > "8" > ... > "11" > "10"
        assert_eq!(res.rows[0]["mtime"], json!(9));
        assert_eq!(res.rows.len(), 2);
        assert!(res.info.next_token.is_some());
    }

    #[tokio::test]
    async fn test_update_expected_and_incr() {
        let a = adapter();
        seed(&a).await;
        let stale = Request::new(Op::Update, "messages", json!({"account_id": "a1", "mtime": 0, "status": "done"}))
            .expected(json!({"status": "old"}));
        assert_eq!(run(&a, stale).await.unwrap().affected_rows(), 0);

        let fresh = Request::new(Op::Update, "messages", json!({"account_id": "a1", "mtime": 0, "status": "done"}))
            .expected(json!({"status": "new"}));
        assert_eq!(run(&a, fresh).await.unwrap().affected_rows(), 1);

        for _ in 0..2 {
            run(&a, Request::new(Op::Incr, "messages", json!({"account_id": "a1", "mtime": 0, "hits": 2})))
                .await
                .unwrap();
        }
        let got = run(&a, Request::new(Op::Get, "messages", json!({"account_id": "a1", "mtime": 0}))).await.unwrap();
        assert_eq!(got.rows[0]["hits"], json!(4));
        assert_eq!(got.rows[0]["status"], json!("done"));
    }

    #[tokio::test]
    async fn test_begins_with_on_key() {
        let a = adapter();
        seed(&a).await;
        let req = Request::new(Op::Select, "messages", json!({"account_id": "a1", "mtime": "1"}))
            .with_op("mtime", FieldOp::BeginsWith);
        let res = run(&a, req).await.unwrap();
        let mut got: Vec<i64> = res.rows.iter().map(|r| r["mtime"].as_i64().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, vec![1, 10, 11]);
    }

    #[tokio::test]
    async fn test_del_and_drop() {
        let a = adapter();
        seed(&a).await;
        let del = run(&a, Request::new(Op::Del, "messages", json!({"account_id": "a1", "mtime": 5}))).await.unwrap();
        assert_eq!(del.affected_rows(), 1);
        let again = run(&a, Request::new(Op::Del, "messages", json!({"account_id": "a1", "mtime": 5}))).await.unwrap();
        assert_eq!(again.affected_rows(), 0);

        let dropped = run(&a, Request::new(Op::Drop, "messages", json!({}))).await.unwrap();
        assert_eq!(dropped.affected_rows(), 23);
    }

    #[tokio::test]
    async fn test_create_is_reported_by_cache_columns() {
        let a = adapter();
        let spec = json!({"id": {"primary": 1}, "name": {}});
        let req = Request::new(Op::Create, "Users", spec.clone());
        let info = Arc::new(serde_json::from_value::<TableSpec>(spec).unwrap().to_info());
        let p = prepare(&req, info, &a.capabilities()).unwrap();
        let mut client = a.open().await.unwrap();
        a.query(&mut client, &p).await.unwrap();

        let tables = a.cache_columns(&mut client).await.unwrap();
        assert_eq!(tables["users"].keys, vec!["id"]);
    }
}
