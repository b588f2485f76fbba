// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CouchDB adapter: one database per table, one document per record.
//!
//! The document id is the joined primary key. Range reads go through the
//! `pkey` view, which emits the key tuple, so key prefix lookups become
//! `startkey`/`endkey` ranges and the continuation token is the last view
//! key (resumed with `skip=1`).
//!
//! Writes carry `_rev`. The revision of a read is returned in
//! `info.context`; passing it back in `options.context` makes the next write
//! conditional on it. Without one the adapter reads the current revision
//! and retries when another writer got in first.

mod native;

pub use native::{design_doc, CouchError, CouchNative, HttpCouch, MemoryCouch, ViewQuery, ViewRow, DESIGN_ID, KEY_VIEW};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{list_by_get, Adapter};
use crate::config::PoolConfig;
use crate::emulation::{add_numbers, join_key, key_part, matches_expected, KEY_SEP};
use crate::error::{DbError, Result};
use crate::request::{Capabilities, FieldOp, Op, PreparedRequest, QueryInfo, QueryResult, Row};
use crate::schema::{ColumnType, TableInfo, TableSpec};

/// Rows requested per view page when results are filtered in memory.
const FETCH_SIZE: usize = 100;

/// Attempts at a read-modify-write before giving up.
const MAX_ATTEMPTS: usize = 5;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// High sentinel closing a string prefix range in view collation.
const PREFIX_END: char = '\u{fff0}';

pub struct CouchAdapter {
    client: Arc<dyn CouchNative>,
}

type Client = Arc<dyn CouchNative>;

/// Outcome of one conditional write attempt.
enum Attempt {
    Done(QueryResult),
    Retry,
}

impl CouchAdapter {
    #[must_use]
    pub fn new(client: Arc<dyn CouchNative>) -> Self {
        Self { client }
    }

    /// `http(s)://` URLs talk to a server; an empty URL or `memory://` uses
    /// an in-process store. `options.timeout_ms` bounds each HTTP call.
    pub fn from_config(cfg: &PoolConfig) -> Result<Self> {
        if cfg.url.is_empty() || cfg.url.starts_with("memory:") {
            return Ok(Self::new(Arc::new(MemoryCouch::new())));
        }
        if !cfg.url.starts_with("http://") && !cfg.url.starts_with("https://") {
            return Err(DbError::invalid(format!("unsupported couchdb url '{}'", cfg.url)));
        }
        let timeout = cfg.options.get("timeout_ms").and_then(Value::as_u64).unwrap_or(DEFAULT_TIMEOUT_MS);
        let http = HttpCouch::new(&cfg.url, Duration::from_millis(timeout)).map_err(|e| DbError::connect("couchdb", e))?;
        Ok(Self::new(Arc::new(http)))
    }

    fn doc_id(req: &PreparedRequest, row: &Row) -> String {
        join_key(&req.keys_of(row), KEY_SEP)
    }

    /// Declared non-text columns given as strings are stored typed, so the
    /// view collates numbers as numbers.
    fn coerce(info: &TableInfo, row: &Row) -> Row {
        row.iter().map(|(field, v)| (field.clone(), Self::typed(info, field, v))).collect()
    }

    fn typed(info: &TableInfo, field: &str, v: &Value) -> Value {
        match (info.column_type(field), v) {
            (Some(kind), Value::String(raw)) if kind != ColumnType::Text => kind.decode_text(raw),
            _ => v.clone(),
        }
    }

    /// Record fields and revision of a stored document.
    fn split(doc: Value) -> (Row, Option<String>) {
        let Value::Object(mut row) = doc else {
            return (Row::new(), None);
        };
        row.remove("_id");
        let rev = match row.remove("_rev") {
            Some(Value::String(rev)) => Some(rev),
            _ => None,
        };
        (row, rev)
    }

    fn with_rev(row: Row, rev: Option<&str>) -> Value {
        let mut doc = row;
        if let Some(rev) = rev {
            doc.insert("_rev".to_string(), Value::String(rev.to_string()));
        }
        Value::Object(doc)
    }

    fn written(n: u64, rev: String) -> QueryResult {
        let mut res = QueryResult::affected(n);
        res.info.context = Some(rev);
        res
    }

    async fn current(&self, client: &Client, req: &PreparedRequest) -> Result<Option<(Row, Option<String>)>> {
        let doc = client
            .get_doc(&req.table, &Self::doc_id(req, &req.object))
            .await
            .map_err(|e| self.convert_error(req, e))?;
        Ok(doc.map(Self::split))
    }

    /// Run `attempt` until it settles; a conflict on an explicit
    /// `options.context` settles as "not applied".
    async fn conditional<'a, F, Fut>(&self, req: &'a PreparedRequest, mut attempt: F) -> Result<QueryResult>
    where
        F: FnMut(Option<&'a str>) -> Fut,
        Fut: std::future::Future<Output = Result<Attempt>>,
    {
        let explicit = req.options.context.as_deref();
        for _ in 0..MAX_ATTEMPTS {
            match attempt(explicit).await? {
                Attempt::Done(res) => return Ok(res),
                Attempt::Retry if explicit.is_some() => return Ok(QueryResult::affected(0)),
                Attempt::Retry => debug!(table = %req.table, op = %req.op, "revision conflict, retrying"),
            }
        }
        Err(DbError::backend_code("couchdb", "conflict", "document update conflict", true))
    }

    async fn put_doc(&self, client: &Client, req: &PreparedRequest, row: Row, rev: Option<&str>) -> Result<Option<String>> {
        match client.put_doc(&req.table, &Self::doc_id(req, &row), Self::with_rev(row, rev)).await {
            Ok(rev) => Ok(Some(rev)),
            Err(e) if e.is_conflict() && req.op != Op::Add => Ok(None),
            Err(e) => Err(self.convert_error(req, e)),
        }
    }

    async fn get(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let Some((row, rev)) = self.current(client, req).await? else {
            return Ok(QueryResult::rows(Vec::new()));
        };
        Ok(QueryResult {
            rows: req.finish(vec![row]),
            info: QueryInfo { context: rev, ..Default::default() },
        })
    }

    async fn add(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let row: Row = Self::coerce(&req.info, &req.object).into_iter().filter(|(_, v)| !v.is_null()).collect();
        let rev = self.put_doc(client, req, row, None).await?.unwrap_or_default();
        Ok(Self::written(1, rev))
    }

    async fn put(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let row: Row = Self::coerce(&req.info, &req.object).into_iter().filter(|(_, v)| !v.is_null()).collect();
        self.conditional(req, |explicit| {
            let row = row.clone();
            async move {
                let rev = match explicit {
                    Some(rev) => Some(rev.to_string()),
                    None => self.current(client, req).await?.and_then(|(_, rev)| rev),
                };
                Ok(match self.put_doc(client, req, row, rev.as_deref()).await? {
                    Some(rev) => Attempt::Done(Self::written(1, rev)),
                    None => Attempt::Retry,
                })
            }
        })
        .await
    }

    async fn update(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let data = Self::coerce(&req.info, &req.data());
        if data.is_empty() {
            return Ok(QueryResult::affected(0));
        }
        self.conditional(req, |explicit| {
            let data = data.clone();
            async move {
                let Some((mut row, rev)) = self.current(client, req).await? else {
                    return Ok(Attempt::Done(QueryResult::affected(0)));
                };
                if req.options.expected.as_ref().is_some_and(|e| !matches_expected(&row, e)) {
                    return Ok(Attempt::Done(QueryResult::affected(0)));
                }
                for (field, value) in data {
                    if value.is_null() {
                        row.remove(&field);
                    } else {
                        row.insert(field, value);
                    }
                }
                let rev = explicit.map(str::to_string).or(rev);
                Ok(match self.put_doc(client, req, row, rev.as_deref()).await? {
                    Some(rev) => Attempt::Done(Self::written(1, rev)),
                    None => Attempt::Retry,
                })
            }
        })
        .await
    }

    async fn incr(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        self.conditional(req, |explicit| async move {
            let (mut row, rev) = match self.current(client, req).await? {
                Some(found) => found,
                None => (req.key_row(), None),
            };
            for (field, by) in req.data() {
                let current = row.get(&field).cloned().unwrap_or(Value::from(0));
                row.insert(field, add_numbers(&current, &by));
            }
            let rev = explicit.map(str::to_string).or(rev);
            Ok(match self.put_doc(client, req, row, rev.as_deref()).await? {
                Some(rev) => Attempt::Done(Self::written(1, rev)),
                None => Attempt::Retry,
            })
        })
        .await
    }

    async fn del(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let id = Self::doc_id(req, &req.object);
        self.conditional(req, |explicit| {
            let id = id.clone();
            async move {
                let Some((row, rev)) = self.current(client, req).await? else {
                    return Ok(Attempt::Done(QueryResult::affected(0)));
                };
                if req.options.expected.as_ref().is_some_and(|e| !matches_expected(&row, e)) {
                    return Ok(Attempt::Done(QueryResult::affected(0)));
                }
                let rev = explicit.map(str::to_string).or(rev).unwrap_or_default();
                match client.delete_doc(&req.table, &id, &rev).await {
                    Ok(()) => Ok(Attempt::Done(QueryResult::affected(1))),
                    Err(e) if e.is_conflict() => Ok(Attempt::Retry),
                    Err(e) if e.status() == Some(404) => Ok(Attempt::Done(QueryResult::affected(0))),
                    Err(e) => Err(self.convert_error(req, e)),
                }
            }
        })
        .await
    }

    /// `startkey`/`endkey` for the key prefix of a select, ascending.
    fn key_range(req: &PreparedRequest) -> (Option<Value>, Option<Value>) {
        let (fixed, tail) = req.key_prefix();
        let fixed: Vec<Value> = req
            .keys
            .iter()
            .zip(&fixed)
            .map(|(k, v)| Self::typed(&req.info, k, v))
            .collect();
        let prefix = tail.and_then(|t| {
            let text = key_part(&t.value);
            match text.strip_suffix('%') {
                Some(p) => Some(p.to_string()),
                None if t.op == FieldOp::BeginsWith => Some(text),
                None => None,
            }
        });
        match prefix {
            Some(p) => {
                let mut start = fixed.clone();
                start.push(Value::String(p.clone()));
                let mut end = fixed;
                end.push(Value::String(format!("{p}{PREFIX_END}")));
                (Some(Value::Array(start)), Some(Value::Array(end)))
            }
            None if fixed.is_empty() => (None, None),
            None => {
                let mut end = fixed.clone();
                end.push(json!({}));
                (Some(Value::Array(fixed)), Some(Value::Array(end)))
            }
        }
    }

    async fn select(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let (fixed, _) = req.key_prefix();
        if !req.keys.is_empty() && fixed.len() == req.keys.len() {
            let id = join_key(&fixed, KEY_SEP);
            let doc = client.get_doc(&req.table, &id).await.map_err(|e| self.convert_error(req, e))?;
            let filter = req.full_filter();
            let rows = doc.map(|d| Self::split(d).0).into_iter().filter(|r| filter.matches(r)).collect();
            return Ok(QueryResult::rows(req.finish(rows)));
        }

        let descending = req.options.desc && req.sort.is_none();
        let (low, high) = Self::key_range(req);
        let (start, end) = if descending { (high, low) } else { (low, high) };
        let fetch = req.count.map(|c| c.max(FETCH_SIZE));
        let filter = req.full_filter();

        let mut query = ViewQuery { start_key: start, end_key: end, descending, skip: 0, limit: fetch };
        if let Some(token) = &req.start {
            if !token.is_array() {
                return Err(DbError::invalid(format!("invalid couchdb page token {token}")));
            }
            query.start_key = Some(token.clone());
            query.skip = 1;
        }

        let mut rows = Vec::new();
        let mut token = None;
        'pages: loop {
            let batch = client.view(&req.table, &query).await.map_err(|e| self.convert_error(req, e))?;
            let exhausted = fetch.map_or(true, |n| batch.len() < n);
            for view_row in batch {
                query.start_key = Some(view_row.key.clone());
                query.skip = 1;
                let (row, _) = Self::split(view_row.doc);
                if !filter.matches(&row) {
                    continue;
                }
                rows.push(row);
                if req.page_full(rows.len()) {
                    token = Some(view_row.key);
                    break 'pages;
                }
            }
            if exhausted {
                break;
            }
        }
        Ok(QueryResult {
            rows: req.finish(rows),
            info: QueryInfo { next_token: token, ..Default::default() },
        })
    }

    async fn design(&self, client: &Client, req: &PreparedRequest) -> Result<(TableSpec, Option<String>)> {
        let doc = client.get_doc(&req.table, DESIGN_ID).await.map_err(|e| self.convert_error(req, e))?;
        let Some(doc) = doc else {
            return Ok((TableSpec::new(), None));
        };
        let spec = serde_json::from_value(doc.get("spec").cloned().unwrap_or(json!({})))
            .map_err(|e| DbError::backend_code("couchdb", "codec", e, false))?;
        let rev = doc.get("_rev").and_then(Value::as_str).map(str::to_string);
        Ok((spec, rev))
    }

    async fn schema_op(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        if req.op == Op::Drop {
            client.delete_db(&req.table).await.map_err(|e| self.convert_error(req, e))?;
            return Ok(QueryResult::affected(0));
        }
        if req.op == Op::Create {
            client.create_db(&req.table).await.map_err(|e| self.convert_error(req, e))?;
        }
        let incoming: TableSpec =
            serde_json::from_value(Value::Object(req.object.clone())).map_err(|e| DbError::invalid(e.to_string()))?;
        let (mut spec, rev) = self.design(client, req).await?;
        spec.columns.extend(incoming.columns);
        let keys = spec.to_info().keys;
        let spec_json = serde_json::to_value(&spec).map_err(|e| DbError::invalid(e.to_string()))?;
        let mut doc = design_doc(&keys, &spec_json);
        if let (Some(rev), Value::Object(map)) = (rev, &mut doc) {
            map.insert("_rev".into(), Value::String(rev));
        }
        client.put_doc(&req.table, DESIGN_ID, doc).await.map_err(|e| self.convert_error(req, e))?;
        Ok(QueryResult::affected(0))
    }
}

#[async_trait]
impl Adapter for CouchAdapter {
    type Client = Client;
    type NativeError = CouchError;

    fn kind(&self) -> &'static str {
        "couchdb"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::KEYED
    }

    async fn open(&self) -> Result<Client> {
        Ok(Arc::clone(&self.client))
    }

    async fn query(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        match req.op {
            Op::Get => self.get(client, req).await,
            Op::Select => self.select(client, req).await,
            Op::List => list_by_get(self, client, req).await,
            Op::Add => self.add(client, req).await,
            Op::Put => self.put(client, req).await,
            Op::Update => self.update(client, req).await,
            Op::Incr => self.incr(client, req).await,
            Op::Del => self.del(client, req).await,
            Op::Create | Op::Upgrade | Op::Drop => self.schema_op(client, req).await,
        }
    }

    async fn cache_columns(&self, client: &mut Client) -> Result<HashMap<String, TableInfo>> {
        let dbs = client.all_dbs().await.map_err(|e| DbError::backend("couchdb", e))?;
        let mut tables = HashMap::new();
        for db in dbs.into_iter().filter(|d| !d.starts_with('_')) {
            let Some(doc) = client.get_doc(&db, DESIGN_ID).await.map_err(|e| DbError::backend("couchdb", e))? else {
                continue;
            };
            let Some(spec) = doc.get("spec").cloned() else {
                continue;
            };
            let spec: TableSpec = serde_json::from_value(spec).map_err(|e| DbError::backend_code("couchdb", "codec", e, false))?;
            tables.insert(db, spec.to_info());
        }
        Ok(tables)
    }

    fn next_token(&self, _req: &PreparedRequest, _rows: &[Row]) -> Option<Value> {
        None
    }

    fn convert_error(&self, req: &PreparedRequest, err: CouchError) -> DbError {
        match err {
            CouchError::Http { status: 409, .. } if req.op == Op::Add => {
                DbError::AlreadyExists { table: req.table.clone() }
            }
            CouchError::Io(message) => DbError::Connect { backend: "couchdb".into(), message },
            CouchError::Http { status, .. } => {
                let transient = status >= 500 || status == 429;
                DbError::backend_code("couchdb", status, &err, transient)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{prepare, Request};

    fn spec() -> TableSpec {
        TableSpec::new()
            .primary("account_id", ColumnType::Text)
            .primary("mtime", ColumnType::Int)
            .column("status", ColumnType::Text)
            .column("hits", ColumnType::Int)
    }

    async fn adapter() -> (CouchAdapter, Client) {
        let a = CouchAdapter::new(Arc::new(MemoryCouch::new()));
        let mut c = a.open().await.unwrap();
        run(&a, &mut c, Request::new(Op::Create, "messages", serde_json::to_value(spec()).unwrap())).await.unwrap();
        (a, c)
    }

    async fn run(a: &CouchAdapter, client: &mut Client, req: Request) -> Result<QueryResult> {
        let p = prepare(&req, Arc::new(spec().to_info()), &a.capabilities())?;
        a.query(client, &p).await
    }

    #[tokio::test]
    async fn test_rev_is_threaded_through_context() {
        let (a, mut c) = adapter().await;
        let row = json!({"account_id": "a", "mtime": 1, "status": "new"});
        let added = run(&a, &mut c, Request::new(Op::Add, "messages", row.clone())).await.unwrap();
        assert!(added.info.context.as_deref().is_some_and(|r| r.starts_with("1-")));
        let dup = run(&a, &mut c, Request::new(Op::Add, "messages", row)).await;
        assert!(matches!(dup, Err(DbError::AlreadyExists { .. })));

        let got = run(&a, &mut c, Request::new(Op::Get, "messages", json!({"account_id": "a", "mtime": 1})))
            .await
            .unwrap();
        let rev = got.info.context.clone().unwrap();
        assert!(got.rows[0].get("_rev").is_none());

        let mut first = Request::new(Op::Update, "messages", json!({"account_id": "a", "mtime": 1, "status": "one"}));
        first.options.context = Some(rev.clone());
        assert_eq!(run(&a, &mut c, first).await.unwrap().affected_rows(), 1);

        let mut stale = Request::new(Op::Update, "messages", json!({"account_id": "a", "mtime": 1, "status": "two"}));
        stale.options.context = Some(rev);
        assert_eq!(run(&a, &mut c, stale).await.unwrap().affected_rows(), 0);

        let plain = Request::new(Op::Update, "messages", json!({"account_id": "a", "mtime": 1, "status": "three"}));
        assert_eq!(run(&a, &mut c, plain).await.unwrap().affected_rows(), 1);
    }

    #[tokio::test]
    async fn test_view_pagination_and_prefix() {
        let (a, mut c) = adapter().await;
        for account in ["a", "b"] {
            for mtime in 0..12 {
                let row = json!({"account_id": account, "mtime": mtime, "status": if mtime % 3 == 0 { "x" } else { "y" }});
                run(&a, &mut c, Request::new(Op::Add, "messages", row)).await.unwrap();
            }
        }
        let mut token = None;
        let mut seen = Vec::new();
        loop {
            let req = Request::new(Op::Select, "messages", json!({"account_id": "a"})).count(5).start(token.clone());
            let res = run(&a, &mut c, req).await.unwrap();
            seen.extend(res.rows.iter().map(|r| r["mtime"].as_i64().unwrap()));
            token = res.info.next_token;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(seen, (0..12).collect::<Vec<_>>());

        let req = Request::new(Op::Select, "messages", json!({"status": "x"}));
        assert_eq!(run(&a, &mut c, req).await.unwrap().rows.len(), 8);

        let mut desc = Request::new(Op::Select, "messages", json!({"account_id": "b"})).count(2);
        desc.options.desc = true;
        let res = run(&a, &mut c, desc).await.unwrap();
        let got: Vec<i64> = res.rows.iter().map(|r| r["mtime"].as_i64().unwrap()).collect();
        assert_eq!(got, vec![11, 10]);

        run(&a, &mut c, Request::new(Op::Add, "messages", json!({"account_id": "ab", "mtime": 0}))).await.unwrap();
        let prefix = Request::new(Op::Select, "messages", json!({"account_id": "a"})).with_op("account_id", FieldOp::BeginsWith);
        let res = run(&a, &mut c, prefix).await.unwrap();
        assert_eq!(res.rows.len(), 13);
        assert!(res.rows.iter().all(|r| r["account_id"].as_str().is_some_and(|s| s.starts_with('a'))));
    }

    #[tokio::test]
    async fn test_incr_del_and_schema() {
        let (a, mut c) = adapter().await;
        for _ in 0..3 {
            run(&a, &mut c, Request::new(Op::Incr, "messages", json!({"account_id": "a", "mtime": 1, "hits": 2})))
                .await
                .unwrap();
        }
        let got = run(&a, &mut c, Request::new(Op::Get, "messages", json!({"account_id": "a", "mtime": 1})))
            .await
            .unwrap();
        assert_eq!(got.rows[0]["hits"], json!(6));

        let del = Request::new(Op::Del, "messages", json!({"account_id": "a", "mtime": 1}));
        assert_eq!(run(&a, &mut c, del.clone()).await.unwrap().affected_rows(), 1);
        assert_eq!(run(&a, &mut c, del).await.unwrap().affected_rows(), 0);

        let tables = a.cache_columns(&mut c).await.unwrap();
        assert_eq!(tables["messages"].keys, vec!["account_id".to_string(), "mtime".to_string()]);
        run(&a, &mut c, Request::new(Op::Drop, "messages", Value::Null)).await.unwrap();
        assert!(a.cache_columns(&mut c).await.unwrap().is_empty());
    }
}
