// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cassandra adapter.
//!
//! The first key column is the partition key, the rest are clustering
//! columns. Native narrowing uses the longest key prefix CQL accepts without
//! `ALLOW FILTERING`: equality on the partition key, equality on leading
//! clustering columns, and a text range for a `begins_with` on the next one.
//! Everything else is filtered in memory.
//!
//! The continuation token is the key tuple of the last row returned. Inside
//! a fixed partition a page resumes with a clustering slice
//! `(c1, c2) > (?, ?)`. A scan across partitions resumes in two steps: the
//! rest of the last partition, then `token(p) > token(?)`.

mod cql;
mod session;

pub use cql::{cql_type, quote, Assignment, CmpOp, Condition, CqlStatement, Relation};
pub use session::{token, CqlError, CqlRows, CqlSession, MemoryCql};
#[cfg(feature = "cassandra")]
pub use session::ScyllaSession;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{list_by_get, Adapter};
use crate::config::PoolConfig;
use crate::error::{DbError, Result};
use crate::request::{Capabilities, FieldOp, NativeSort, Op, PreparedRequest, QueryInfo, QueryResult, Row};
use crate::schema::{ColumnType, TableInfo, TableSpec};

/// Rows requested per native page when results are filtered in memory.
const FETCH_SIZE: usize = 100;

const DEFAULT_KEYSPACE: &str = "polystore";

/// Upper bound appended to a text prefix to close its range.
const PREFIX_END: char = '\u{10FFFF}';

enum Backend {
    Memory(MemoryCql),
    #[cfg(feature = "cassandra")]
    Cluster { nodes: Vec<String>, keyspace: String },
}

pub struct CassandraAdapter {
    backend: Backend,
    session: OnceCell<Arc<dyn CqlSession>>,
}

type Client = Arc<dyn CqlSession>;

/// Where the next native page starts.
#[derive(Debug, Clone)]
enum Cursor {
    Start,
    /// After this key tuple, inside its partition.
    Within(Vec<Value>),
    /// First partition whose token follows this key tuple's partition.
    Next(Vec<Value>),
}

impl CassandraAdapter {
    #[must_use]
    pub fn memory(cql: MemoryCql) -> Self {
        Self { backend: Backend::Memory(cql), session: OnceCell::new() }
    }

    /// `cassandra://host1:9042,host2:9042/keyspace`; an empty URL or
    /// `memory://` uses an in-process keyspace.
    pub fn from_config(cfg: &PoolConfig) -> Result<Self> {
        if cfg.url.is_empty() || cfg.url.starts_with("memory:") {
            return Ok(Self::memory(MemoryCql::new()));
        }
        let rest = cfg
            .url
            .strip_prefix("cassandra://")
            .ok_or_else(|| DbError::invalid(format!("unsupported cassandra url '{}'", cfg.url)))?;
        let (hosts, keyspace) = rest.split_once('/').unwrap_or((rest, ""));
        let keyspace = cfg
            .option_str("keyspace")
            .map(str::to_string)
            .unwrap_or_else(|| if keyspace.is_empty() { DEFAULT_KEYSPACE.to_string() } else { keyspace.to_string() });
        let nodes: Vec<String> = hosts.split(',').filter(|h| !h.is_empty()).map(str::to_string).collect();
        Self::cluster(nodes, keyspace)
    }

    #[cfg(feature = "cassandra")]
    fn cluster(nodes: Vec<String>, keyspace: String) -> Result<Self> {
        Ok(Self { backend: Backend::Cluster { nodes, keyspace }, session: OnceCell::new() })
    }

    #[cfg(not(feature = "cassandra"))]
    fn cluster(_nodes: Vec<String>, _keyspace: String) -> Result<Self> {
        Err(DbError::Unsupported {
            backend: "cassandra".to_string(),
            op: "cluster connections (built without the `cassandra` feature)".to_string(),
        })
    }

    async fn connect(&self) -> std::result::Result<Client, CqlError> {
        match &self.backend {
            Backend::Memory(cql) => Ok(Arc::new(cql.clone())),
            #[cfg(feature = "cassandra")]
            Backend::Cluster { nodes, keyspace } => Ok(Arc::new(ScyllaSession::connect(nodes, keyspace).await?)),
        }
    }

    async fn run(&self, client: &Client, req: &PreparedRequest, stmt: CqlStatement) -> Result<CqlRows> {
        client.execute(&stmt).await.map_err(|e| self.convert_error(req, e))
    }

    /// JSON columns are stored as text.
    fn encode(info: &TableInfo, row: &Row) -> Row {
        row.iter()
            .map(|(col, v)| {
                let v = match (info.column_type(col), v) {
                    (Some(ColumnType::Json), Value::Array(_) | Value::Object(_)) => Value::String(v.to_string()),
                    _ => v.clone(),
                };
                (col.clone(), v)
            })
            .collect()
    }

    fn decode(info: &TableInfo, row: Row) -> Row {
        row.into_iter()
            .map(|(col, v)| match (info.column_type(&col), v) {
                (Some(ColumnType::Json), Value::String(raw)) => (col, ColumnType::Json.decode_text(&raw)),
                (_, v) => (col, v),
            })
            .collect()
    }

    fn key_relations(req: &PreparedRequest, row: &Row) -> Vec<Relation> {
        req.keys
            .iter()
            .map(|k| Relation::Eq(k.clone(), row.get(k).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    async fn get(&self, client: &Client, req: &PreparedRequest, keys: &Row) -> Result<Option<Row>> {
        let stmt = CqlStatement::Select {
            table: req.table.clone(),
            relations: Self::key_relations(req, keys),
            order: None,
            limit: Some(1),
        };
        let res = self.run(client, req, stmt).await?;
        Ok(res.rows.into_iter().next().map(|r| Self::decode(&req.info, r)))
    }

    async fn add(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let row: Row = Self::encode(&req.info, &req.object).into_iter().filter(|(_, v)| !v.is_null()).collect();
        let stmt = CqlStatement::Insert { table: req.table.clone(), row, condition: Condition::NotExists };
        match self.run(client, req, stmt).await?.applied {
            Some(false) => Err(DbError::AlreadyExists { table: req.table.clone() }),
            _ => Ok(QueryResult::affected(1)),
        }
    }

    /// Full replace: declared columns absent from the input are cleared.
    async fn put(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let mut row = Self::encode(&req.info, &req.object);
        for (name, col) in &req.info.columns {
            if col.kind != ColumnType::Counter && !row.contains_key(name) {
                row.insert(name.clone(), Value::Null);
            }
        }
        let stmt = CqlStatement::Insert { table: req.table.clone(), row, condition: Condition::None };
        self.run(client, req, stmt).await?;
        Ok(QueryResult::affected(1))
    }

    async fn update(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let data = Self::encode(&req.info, &req.data());
        if data.is_empty() {
            return Ok(QueryResult::affected(0));
        }
        let condition = match &req.options.expected {
            Some(expected) if !expected.is_empty() => Condition::Equals(Self::encode(&req.info, expected)),
            _ => Condition::Exists,
        };
        let stmt = CqlStatement::Update {
            table: req.table.clone(),
            keys: req.key_row(),
            assignments: data.into_iter().map(|(c, v)| Assignment::Set(c, v)).collect(),
            condition,
        };
        let applied = self.run(client, req, stmt).await?.applied.unwrap_or(true);
        Ok(QueryResult::affected(u64::from(applied)))
    }

    async fn incr(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let stmt = CqlStatement::Update {
            table: req.table.clone(),
            keys: req.key_row(),
            assignments: req.data().into_iter().map(|(c, v)| Assignment::Add(c, v)).collect(),
            condition: Condition::None,
        };
        self.run(client, req, stmt).await?;
        Ok(QueryResult::affected(1))
    }

    async fn del(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let stmt = CqlStatement::Delete { table: req.table.clone(), keys: req.key_row(), condition: Condition::Exists };
        let applied = self.run(client, req, stmt).await?.applied.unwrap_or(true);
        Ok(QueryResult::affected(u64::from(applied)))
    }

    /// `[p, c1, ...]` from a previous page.
    fn parse_token(req: &PreparedRequest) -> Result<Option<Vec<Value>>> {
        match &req.start {
            None => Ok(None),
            Some(Value::Array(keys)) if keys.len() == req.keys.len() => Ok(Some(keys.clone())),
            Some(other) => Err(DbError::invalid(format!("invalid cassandra page token {other}"))),
        }
    }

    /// Relations from the fixed key prefix, plus a text range for a trailing
    /// prefix match on a clustering column.
    fn prefix_relations(req: &PreparedRequest, fixed: &[Value]) -> (Vec<Relation>, Vec<Relation>) {
        let eq = req.keys.iter().zip(fixed).map(|(k, v)| Relation::Eq(k.clone(), v.clone())).collect();
        let (_, tail) = req.key_prefix();
        let mut range = Vec::new();
        if let Some(tail) = tail.filter(|_| !fixed.is_empty()) {
            let is_text = matches!(req.info.column_type(&tail.field), Some(ColumnType::Text) | None);
            let prefix = match (&tail.value, tail.op) {
                (Value::String(s), FieldOp::BeginsWith) => Some(s.clone()),
                (Value::String(s), FieldOp::Like) => s.strip_suffix('%').map(str::to_string),
                _ => None,
            };
            if let (true, Some(prefix)) = (is_text, prefix) {
                range.push(Relation::Cmp(tail.field.clone(), CmpOp::Ge, Value::String(prefix.clone())));
                range.push(Relation::Cmp(tail.field.clone(), CmpOp::Lt, Value::String(format!("{prefix}{PREFIX_END}"))));
            }
        }
        (eq, range)
    }

    async fn select(&self, client: &Client, req: &PreparedRequest) -> Result<QueryResult> {
        let (fixed, _) = req.key_prefix();
        if !req.keys.is_empty() && fixed.len() == req.keys.len() {
            let keys: Row = req.keys.iter().cloned().zip(fixed).collect();
            let filter = req.full_filter();
            let rows = self.get(client, req, &keys).await?.into_iter().filter(|r| filter.matches(r)).collect();
            return Ok(QueryResult::rows(req.finish(rows)));
        }

        let partitioned = !fixed.is_empty();
        let clustering: &[String] = req.keys.get(1..).unwrap_or(&[]);
        let free: Vec<String> = req.keys.iter().skip(fixed.len().max(1)).cloned().collect();
        let (eq, range) = Self::prefix_relations(req, &fixed);
        let desc = partitioned && req.native_sort.as_ref().map_or(req.options.desc, |s| s.desc);
        let order = (partitioned && !clustering.is_empty()).then(|| (clustering[0].clone(), desc));
        let fetch = req.count.map(|c| c.max(FETCH_SIZE));
        let filter = req.full_filter();

        let resume = |last: Vec<Value>| {
            if !partitioned && clustering.is_empty() {
                Cursor::Next(last)
            } else {
                Cursor::Within(last)
            }
        };
        let mut cursor = Self::parse_token(req)?.map_or(Cursor::Start, &resume);
        let mut rows = Vec::new();
        let mut token = None;

        'pages: loop {
            let relations = match &cursor {
                Cursor::Start => eq.iter().chain(&range).cloned().collect(),
                Cursor::Within(last) if partitioned => {
                    let mut relations = eq.clone();
                    let tail: Vec<Value> = last.iter().skip(fixed.len()).cloned().collect();
                    if !free.is_empty() {
                        let op = if desc { CmpOp::Lt } else { CmpOp::Gt };
                        relations.push(Relation::Tuple(free.clone(), op, tail));
                    }
                    relations
                }
                Cursor::Within(last) => vec![
                    Relation::Eq(req.keys[0].clone(), last[0].clone()),
                    Relation::Tuple(clustering.to_vec(), CmpOp::Gt, last[1..].to_vec()),
                ],
                Cursor::Next(last) => vec![Relation::TokenAfter(req.keys[0].clone(), last[0].clone())],
            };
            let rest_of_partition = !partitioned && matches!(cursor, Cursor::Within(_));
            let stmt = CqlStatement::Select {
                table: req.table.clone(),
                relations,
                order: order.clone(),
                limit: fetch,
            };
            let batch = self.run(client, req, stmt).await?.rows;
            let exhausted = fetch.map_or(true, |n| batch.len() < n);

            for row in batch {
                let row = Self::decode(&req.info, row);
                let last = req.keys_of(&row);
                cursor = resume(last.clone());
                if !filter.matches(&row) {
                    continue;
                }
                rows.push(row);
                if req.page_full(rows.len()) {
                    token = Some(Value::Array(last));
                    break 'pages;
                }
            }

            if !exhausted {
                continue;
            }
            match cursor {
                Cursor::Within(last) if rest_of_partition => {
                    debug!(table = %req.table, "partition exhausted, moving to next token");
                    cursor = Cursor::Next(last);
                }
                _ => break,
            }
        }

        // ORDER BY needs a fixed partition; otherwise order the page itself.
        if !partitioned {
            if let Some(sort) = &req.native_sort {
                sort.apply(&mut rows);
            }
        }
        Ok(QueryResult {
            rows: req.finish(rows),
            info: QueryInfo { next_token: token, ..Default::default() },
        })
    }

    fn table_spec(req: &PreparedRequest) -> Result<TableSpec> {
        serde_json::from_value(Value::Object(req.object.clone())).map_err(|e| DbError::invalid(e.to_string()))
    }
}

#[async_trait]
impl Adapter for CassandraAdapter {
    type Client = Client;
    type NativeError = CqlError;

    fn kind(&self) -> &'static str {
        "cassandra"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { sort: NativeSort::KeyAt(1), ..Capabilities::KEYED }
    }

    async fn open(&self) -> Result<Client> {
        let session = self
            .session
            .get_or_try_init(|| self.connect())
            .await
            .map_err(|e| DbError::connect("cassandra", e))?;
        Ok(Arc::clone(session))
    }

    async fn query(&self, client: &mut Client, req: &PreparedRequest) -> Result<QueryResult> {
        match req.op {
            Op::Get => {
                let rows = self.get(client, req, &req.object).await?.into_iter().collect();
                Ok(QueryResult::rows(req.finish(rows)))
            }
            Op::Select => self.select(client, req).await,
            Op::List => list_by_get(self, client, req).await,
            Op::Add => self.add(client, req).await,
            Op::Put => self.put(client, req).await,
            Op::Update => self.update(client, req).await,
            Op::Incr => self.incr(client, req).await,
            Op::Del => self.del(client, req).await,
            Op::Create => {
                let stmt = CqlStatement::Create { table: req.table.clone(), spec: Self::table_spec(req)? };
                self.run(client, req, stmt).await?;
                Ok(QueryResult::affected(0))
            }
            Op::Upgrade => {
                let stmt = CqlStatement::AddColumns { table: req.table.clone(), spec: Self::table_spec(req)? };
                self.run(client, req, stmt).await?;
                Ok(QueryResult::affected(0))
            }
            Op::Drop => {
                self.run(client, req, CqlStatement::Drop { table: req.table.clone() }).await?;
                Ok(QueryResult::affected(0))
            }
        }
    }

    async fn cache_columns(&self, client: &mut Client) -> Result<HashMap<String, TableInfo>> {
        client.tables().await.map_err(|e| DbError::backend_code("cassandra", e.code(), &e, e.is_transient()))
    }

    fn next_token(&self, _req: &PreparedRequest, _rows: &[Row]) -> Option<Value> {
        None
    }

    fn convert_error(&self, _req: &PreparedRequest, err: CqlError) -> DbError {
        match err {
            CqlError::Connection(message) => DbError::Connect { backend: "cassandra".into(), message },
            other => DbError::backend_code("cassandra", other.code(), &other, other.is_transient()),
        }
    }
}
