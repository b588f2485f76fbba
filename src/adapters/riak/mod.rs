// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Riak adapter: one bucket per table, one JSON object per record.
//!
//! Every object is indexed under `pk_bin` with the hex-encoded joined
//! primary key, so key prefix reads are 2i range queries and the page token
//! is Riak's own continuation string. Non-key filters and sorts run in
//! memory on each page.
//!
//! Writes carry the vector clock of the last read. Reads return it in
//! `info.context`, the adapter also remembers it per key, and
//! `options.context` overrides both. Read-modify-write operations guard the
//! store with `If-Match` on the etag they read and retry on 412.

mod native;

pub use native::{HttpRiak, IndexPage, MemoryRiak, Precondition, RiakError, RiakNative, RiakObject, KEY_INDEX};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use super::{list_by_get, Adapter};
use crate::config::PoolConfig;
use crate::emulation::{add_numbers, join_key, key_part, matches_expected, KEY_SEP};
use crate::error::{DbError, Result};
use crate::request::{Capabilities, FieldOp, Op, PreparedRequest, QueryInfo, QueryResult, Row};
use crate::schema::{ColumnType, TableInfo, TableSpec};

/// Bucket holding table definitions, keyed by table name.
const META_BUCKET: &str = "_polystore_tables";

/// Attempts at a read-modify-write before giving up.
const MAX_ATTEMPTS: usize = 5;

/// Remembered vector clocks; the map is cleared when it grows past this.
const MAX_CONTEXTS: usize = 10_000;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Sorts after every hex digit, closing a prefix range.
const TERM_END: &str = "g";

/// Lowest possible term.
const TERM_START: &str = "0";

type Client = Arc<dyn RiakNative>;

pub struct RiakAdapter {
    client: Arc<dyn RiakNative>,
    contexts: DashMap<String, String>,
}

/// Hex form of `text`; preserves byte order and prefixes.
fn hex_term(text: &str) -> String {
    text.bytes().map(|b| format!("{b:02x}")).collect()
}

impl RiakAdapter {
    #[must_use]
    pub fn new(client: Arc<dyn RiakNative>) -> Self {
        Self { client, contexts: DashMap::new() }
    }

    /// `http(s)://` URLs talk to a node; an empty URL or `memory://` uses an
    /// in-process store.
    pub fn from_config(cfg: &PoolConfig) -> Result<Self> {
        if cfg.url.is_empty() || cfg.url.starts_with("memory:") {
            return Ok(Self::new(Arc::new(MemoryRiak::new())));
        }
        if !cfg.url.starts_with("http://") && !cfg.url.starts_with("https://") {
            return Err(DbError::invalid(format!("unsupported riak url '{}'", cfg.url)));
        }
        let timeout = cfg.options.get("timeout_ms").and_then(Value::as_u64).unwrap_or(DEFAULT_TIMEOUT_MS);
        let http = HttpRiak::new(&cfg.url, Duration::from_millis(timeout)).map_err(|e| DbError::connect("riak", e))?;
        Ok(Self::new(Arc::new(http)))
    }

    fn object_key(req: &PreparedRequest, row: &Row) -> String {
        join_key(&req.keys_of(row), KEY_SEP)
    }

    fn context_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    fn remember(&self, bucket: &str, key: &str, vclock: Option<&String>) {
        let Some(vclock) = vclock else {
            return;
        };
        if self.contexts.len() >= MAX_CONTEXTS {
            self.contexts.clear();
        }
        self.contexts.insert(Self::context_key(bucket, key), vclock.clone());
    }

    fn forget(&self, bucket: &str, key: &str) {
        self.contexts.remove(&Self::context_key(bucket, key));
    }

    /// Vector clock to send with a blind write of `key`.
    fn context_for(&self, req: &PreparedRequest, key: &str) -> Option<String> {
        req.options
            .context
            .clone()
            .or_else(|| self.contexts.get(&Self::context_key(&req.table, key)).map(|v| v.clone()))
    }

    fn typed(info: &TableInfo, field: &str, v: &Value) -> Value {
        match (info.column_type(field), v) {
            (Some(kind), Value::String(raw)) if kind != ColumnType::Text => kind.decode_text(raw),
            _ => v.clone(),
        }
    }

    fn coerce(info: &TableInfo, row: &Row) -> Row {
        row.iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(field, v)| (field.clone(), Self::typed(info, field, v)))
            .collect()
    }

    fn row_of(value: Value) -> Row {
        match value {
            Value::Object(row) => row,
            _ => Row::new(),
        }
    }

    async fn fetch(&self, client: &Client, req: &PreparedRequest, key: &str) -> Result<Option<RiakObject>> {
        let object = client.fetch(&req.table, key).await.map_err(|e| self.convert_error(req, e))?;
        if let Some(object) = &object {
            self.remember(&req.table, key, object.vclock.as_ref());
        }
        Ok(object)
    }

    /// Store `row` under `pre`; `None` when the precondition failed.
    async fn store(
        &self,
        client: &Client,
        req: &PreparedRequest,
        row: Row,
        vclock: Option<&str>,
        pre: &Precondition,
    ) -> Result<Option<QueryResult>> {
        let key = Self::object_key(req, &row);
        let term = hex_term(&key);
        match client.store(&req.table, &key, &Value::Object(row), &term, vclock, pre).await {
            Ok(object) => {
                self.remember(&req.table, &key, object.vclock.as_ref());
                let mut res = QueryResult::affected(1);
                res.info.context = object.vclock;
                Ok(Some(res))
            }
            Err(e) if e.is_precondition() && req.op != Op::Add => Ok(None),
            Err(e) => Err(self.convert_error(req, e)),
        }
    }

    async fn get(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let key = Self::object_key(req, &req.object);
        let Some(object) = self.fetch(client, req, &key).await? else {
            return Ok(QueryResult::rows(Vec::new()));
        };
        Ok(QueryResult {
            rows: req.finish(vec![Self::row_of(object.value)]),
            info: QueryInfo { context: object.vclock, ..Default::default() },
        })
    }

    async fn add(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let row = Self::coerce(&req.info, &req.object);
        Ok(self.store(client, req, row, None, &Precondition::Absent).await?.unwrap_or_else(QueryResult::empty))
    }

    async fn put(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let row = Self::coerce(&req.info, &req.object);
        let vclock = self.context_for(req, &Self::object_key(req, &row));
        Ok(self.store(client, req, row, vclock.as_deref(), &Precondition::Any).await?.unwrap_or_else(QueryResult::empty))
    }

    /// Read, let `change` produce the new row (or a final result), store it
    /// guarded by the etag read. Retries while another writer intervenes.
    async fn modify<F>(&self, client: &Client, req: &PreparedRequest, change: F) -> Result<QueryResult>
    where
        F: Fn(Option<Row>) -> std::result::Result<Row, QueryResult> + Send + Sync,
    {
        let key = Self::object_key(req, &req.object);
        let explicit = req.options.context.as_deref();
        for _ in 0..MAX_ATTEMPTS {
            let current = self.fetch(client, req, &key).await?;
            if let (Some(ctx), Some(object)) = (explicit, &current) {
                if object.vclock.as_deref() != Some(ctx) {
                    return Ok(QueryResult::affected(0));
                }
            }
            let (vclock, pre) = match &current {
                Some(object) => (
                    object.vclock.clone(),
                    object.etag.clone().map_or(Precondition::Any, Precondition::Match),
                ),
                None => (None, Precondition::Absent),
            };
            let row = match change(current.map(|o| Self::row_of(o.value))) {
                Ok(row) => row,
                Err(done) => return Ok(done),
            };
            if let Some(res) = self.store(client, req, row, vclock.as_deref(), &pre).await? {
                return Ok(res);
            }
            if explicit.is_some() {
                return Ok(QueryResult::affected(0));
            }
            debug!(table = %req.table, key = %key, "concurrent riak write, retrying");
        }
        Err(DbError::backend_code("riak", 412, "write kept conflicting", true))
    }

    async fn update(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let data = req.data();
        if data.is_empty() {
            return Ok(QueryResult::affected(0));
        }
        self.modify(client, req, |current| {
            let Some(mut row) = current else {
                return Err(QueryResult::affected(0));
            };
            if req.options.expected.as_ref().is_some_and(|e| !matches_expected(&row, e)) {
                return Err(QueryResult::affected(0));
            }
            for (field, value) in &data {
                if value.is_null() {
                    row.remove(field);
                } else {
                    row.insert(field.clone(), Self::typed(&req.info, field, value));
                }
            }
            Ok(row)
        })
        .await
    }

    async fn incr(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let data = req.data();
        self.modify(client, req, |current| {
            let mut row = current.unwrap_or_else(|| req.key_row());
            for (field, by) in &data {
                let now = row.get(field).cloned().unwrap_or(Value::from(0));
                row.insert(field.clone(), add_numbers(&now, by));
            }
            Ok(row)
        })
        .await
    }

    async fn del(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let key = Self::object_key(req, &req.object);
        let Some(object) = self.fetch(client, req, &key).await? else {
            return Ok(QueryResult::affected(0));
        };
        let stale = req.options.context.as_deref().is_some_and(|ctx| object.vclock.as_deref() != Some(ctx));
        let row = Self::row_of(object.value);
        if stale || req.options.expected.as_ref().is_some_and(|e| !matches_expected(&row, e)) {
            return Ok(QueryResult::affected(0));
        }
        let deleted = client
            .delete(&req.table, &key, object.vclock.as_deref())
            .await
            .map_err(|e| self.convert_error(req, e))?;
        self.forget(&req.table, &key);
        Ok(QueryResult::affected(u64::from(deleted)))
    }

    /// `pk_bin` bounds covering the key prefix of a select.
    fn term_range(req: &PreparedRequest) -> (String, String) {
        let (fixed, tail) = req.key_prefix();
        let parts: Vec<String> = fixed.iter().map(key_part).collect();
        let prefix = tail.and_then(|t| {
            let text = key_part(&t.value);
            match text.strip_suffix('%') {
                Some(p) => Some(p.to_string()),
                None if t.op == FieldOp::BeginsWith => Some(text),
                None => None,
            }
        });
        if parts.is_empty() && prefix.is_none() {
            return (TERM_START.to_string(), TERM_END.to_string());
        }
        let mut start = parts.join(&KEY_SEP.to_string());
        if !parts.is_empty() {
            start.push(KEY_SEP);
        }
        if let Some(p) = prefix {
            start.push_str(&p);
        }
        let start = hex_term(&start);
        let end = format!("{start}{TERM_END}");
        (start, end)
    }

    async fn select(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let (fixed, _) = req.key_prefix();
        if !req.keys.is_empty() && fixed.len() == req.keys.len() {
            let key = join_key(&fixed, KEY_SEP);
            let filter = req.full_filter();
            let rows = self
                .fetch(client, req, &key)
                .await?
                .map(|o| Self::row_of(o.value))
                .into_iter()
                .filter(|r| filter.matches(r))
                .collect();
            return Ok(QueryResult::rows(req.finish(rows)));
        }

        let mut continuation = match &req.start {
            None => None,
            Some(Value::String(token)) => Some(token.clone()),
            Some(other) => return Err(DbError::invalid(format!("invalid riak continuation {other}"))),
        };
        let (start, end) = Self::term_range(req);
        let filter = req.full_filter();
        let mut rows = Vec::new();
        loop {
            // Never fetch past the page so the continuation lines up with it.
            let want = req.count.filter(|c| *c > 0).map(|c| c - rows.len());
            let page = client
                .index_range(&req.table, &start, &end, want, continuation.as_deref())
                .await
                .map_err(|e| self.convert_error(req, e))?;
            for key in &page.keys {
                match self.fetch(client, req, key).await? {
                    Some(object) => {
                        let row = Self::row_of(object.value);
                        if filter.matches(&row) {
                            rows.push(row);
                        }
                    }
                    None => debug!(table = %req.table, key = %key, "index entry without object"),
                }
            }
            continuation = page.continuation;
            if continuation.is_none() || req.page_full(rows.len()) {
                break;
            }
        }
        let token = continuation.filter(|_| req.page_full(rows.len())).map(Value::String);
        Ok(QueryResult {
            rows: req.finish(rows),
            info: QueryInfo { next_token: token, ..Default::default() },
        })
    }

    async fn table_spec(&self, client: &Client, req: &PreparedRequest) -> Result<Option<RiakObject>> {
        client.fetch(META_BUCKET, &req.table).await.map_err(|e| self.convert_error(req, e))
    }

    async fn schema_op(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let meta = self.table_spec(client, req).await?;
        if req.op == Op::Drop {
            let mut continuation = None;
            loop {
                let page = client
                    .index_range(&req.table, TERM_START, TERM_END, Some(1000), continuation.as_deref())
                    .await
                    .map_err(|e| self.convert_error(req, e))?;
                for key in &page.keys {
                    client.delete(&req.table, key, None).await.map_err(|e| self.convert_error(req, e))?;
                    self.forget(&req.table, key);
                }
                continuation = page.continuation;
                if continuation.is_none() {
                    break;
                }
            }
            if let Some(meta) = meta {
                client.delete(META_BUCKET, &req.table, meta.vclock.as_deref()).await.map_err(|e| self.convert_error(req, e))?;
            }
            return Ok(QueryResult::affected(0));
        }
        let incoming: TableSpec =
            serde_json::from_value(Value::Object(req.object.clone())).map_err(|e| DbError::invalid(e.to_string()))?;
        let (mut spec, vclock): (TableSpec, _) = match meta {
            Some(object) => (
                serde_json::from_value(object.value).map_err(|e| DbError::backend_code("riak", "codec", e, false))?,
                object.vclock,
            ),
            None => (TableSpec::new(), None),
        };
        spec.columns.extend(incoming.columns);
        let value = serde_json::to_value(&spec).map_err(|e| DbError::invalid(e.to_string()))?;
        client
            .store(META_BUCKET, &req.table, &value, &hex_term(&req.table), vclock.as_deref(), &Precondition::Any)
            .await
            .map_err(|e| self.convert_error(req, e))?;
        Ok(QueryResult::affected(0))
    }
}

#[async_trait]
impl Adapter for RiakAdapter {
    type Client = Client;
    type NativeError = RiakError;

    fn kind(&self) -> &'static str {
        "riak"
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
        let page = client
            .index_range(META_BUCKET, TERM_START, TERM_END, None, None)
            .await
            .map_err(|e| DbError::backend("riak", e))?;
        let mut tables = HashMap::new();
        for table in page.keys {
            let Some(object) = client.fetch(META_BUCKET, &table).await.map_err(|e| DbError::backend("riak", e))? else {
                continue;
            };
            match serde_json::from_value::<TableSpec>(object.value) {
                Ok(spec) => {
                    tables.insert(table, spec.to_info());
                }
                Err(e) => warn!(table = %table, error = %e, "skipping unreadable riak table definition"),
            }
        }
        Ok(tables)
    }

    fn next_token(&self, _req: &PreparedRequest, _rows: &[Row]) -> Option<Value> {
        None
    }

    fn convert_error(&self, req: &PreparedRequest, err: RiakError) -> DbError {
        match err {
            RiakError::Http { status: 412, .. } if req.op == Op::Add => {
                DbError::AlreadyExists { table: req.table.clone() }
            }
            RiakError::Io(message) => DbError::Connect { backend: "riak".into(), message },
            RiakError::Http { status, .. } => {
                let transient = status >= 500 || status == 429;
                DbError::backend_code("riak", status, &err, transient)
            }
        }
    }
}
