// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CQL session seam.
//!
//! [`CqlSession`] is the narrow surface the adapter needs. [`MemoryCql`]
//! interprets statements in process with Cassandra's ordering rules:
//! partitions in token order, rows within a partition in clustering order.
//! With the `cassandra` feature, [`ScyllaSession`] talks to a real cluster.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use super::cql::{Assignment, Condition, CqlStatement, Relation};
use crate::emulation::{add_numbers, compare_values, key_part, matches_expected, values_equal};
use crate::request::Row;
use crate::schema::{TableInfo, TableSpec};

#[derive(Error, Debug, Clone)]
pub enum CqlError {
    #[error("invalid query: {0}")]
    Invalid(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Connection(String),
}

impl CqlError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "io",
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

/// Rows of a statement, plus `[applied]` for conditional writes.
#[derive(Debug, Clone, Default)]
pub struct CqlRows {
    pub rows: Vec<Row>,
    pub applied: Option<bool>,
}

#[async_trait]
pub trait CqlSession: Send + Sync {
    async fn execute(&self, stmt: &CqlStatement) -> Result<CqlRows, CqlError>;

    /// Every table of the keyspace.
    async fn tables(&self) -> Result<HashMap<String, TableInfo>, CqlError>;
}

/// Murmur3 stands in as FNV-1a here; only the ordering property matters.
#[must_use]
pub fn token(partition: &Value) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key_part(partition).bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as i64
}

/// Clustering key, ordered with [`compare_values`].
#[derive(Debug, Clone)]
struct Clustering(Vec<Value>);

impl PartialEq for Clustering {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Clustering {}

impl PartialOrd for Clustering {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Clustering {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_tuples(&self.0, &other.0)
    }
}

fn compare_tuples(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| compare_values(x, y))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

struct MemTable {
    spec: TableSpec,
    keys: Vec<String>,
    /// (token, partition text) → clustering → row
    partitions: BTreeMap<(i64, String), BTreeMap<Clustering, Row>>,
}

impl MemTable {
    fn locate(&self, row: &Row) -> Result<((i64, String), Clustering), CqlError> {
        let mut values = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            match row.get(key) {
                Some(v) if !v.is_null() => values.push(v.clone()),
                _ => return Err(CqlError::Invalid(format!("missing PRIMARY KEY part {key}"))),
            }
        }
        let partition = values.remove(0);
        Ok(((token(&partition), key_part(&partition)), Clustering(values)))
    }

    fn get(&self, row: &Row) -> Result<Option<&Row>, CqlError> {
        let (p, c) = self.locate(row)?;
        Ok(self.partitions.get(&p).and_then(|part| part.get(&c)))
    }

    fn put(&mut self, row: Row) -> Result<(), CqlError> {
        let (p, c) = self.locate(&row)?;
        self.partitions.entry(p).or_default().insert(c, row);
        Ok(())
    }

    fn remove(&mut self, row: &Row) -> Result<bool, CqlError> {
        let (p, c) = self.locate(row)?;
        let Some(part) = self.partitions.get_mut(&p) else {
            return Ok(false);
        };
        let removed = part.remove(&c).is_some();
        if part.is_empty() {
            self.partitions.remove(&p);
        }
        Ok(removed)
    }

    fn holds(&self, rel: &Relation, row: &Row) -> bool {
        let cmp = |col: &str, v: &Value| row.get(col).map(|x| compare_values(x, v));
        match rel {
            Relation::Eq(col, v) => row.get(col).is_some_and(|x| values_equal(x, v)),
            Relation::In(col, items) => row.get(col).is_some_and(|x| items.iter().any(|v| values_equal(x, v))),
            Relation::Cmp(col, op, v) => cmp(col, v).is_some_and(|o| op.holds(o)),
            Relation::Tuple(cols, op, values) => {
                let current: Vec<Value> = cols.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect();
                op.holds(compare_tuples(&current, values))
            }
            Relation::TokenAfter(col, v) => row.get(col).is_some_and(|x| token(x) > token(v)),
        }
    }
}

/// Apply a write row: null clears a column.
fn write_columns(target: &mut Row, row: &Row) {
    for (col, value) in row {
        if value.is_null() {
            target.remove(col);
        } else {
            target.insert(col.clone(), value.clone());
        }
    }
}

/// In-process keyspace. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryCql {
    tables: Arc<Mutex<HashMap<String, MemTable>>>,
}

impl MemoryCql {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, stmt: &CqlStatement) -> Result<CqlRows, CqlError> {
        let mut tables = self.tables.lock();
        let unconfigured = |t: &str| CqlError::Invalid(format!("unconfigured table {t}"));
        match stmt {
            CqlStatement::Select { table, relations, order, limit } => {
                let t = tables.get(table).ok_or_else(|| unconfigured(table))?;
                let desc = order.as_ref().is_some_and(|(_, d)| *d);
                let mut rows = Vec::new();
                for part in t.partitions.values() {
                    let ordered: Box<dyn Iterator<Item = &Row>> =
                        if desc { Box::new(part.values().rev()) } else { Box::new(part.values()) };
                    for row in ordered.filter(|row| relations.iter().all(|rel| t.holds(rel, row))) {
                        rows.push(row.clone());
                        if limit.is_some_and(|n| rows.len() >= n) {
                            return Ok(CqlRows { rows, applied: None });
                        }
                    }
                }
                Ok(CqlRows { rows, applied: None })
            }
            CqlStatement::Insert { table, row, condition } => {
                let t = tables.get_mut(table).ok_or_else(|| unconfigured(table))?;
                let existing = t.get(row)?.cloned();
                if matches!(condition, Condition::NotExists) && existing.is_some() {
                    return Ok(CqlRows { rows: existing.into_iter().collect(), applied: Some(false) });
                }
                let mut target = existing.unwrap_or_default();
                write_columns(&mut target, row);
                t.put(target)?;
                let applied = (!matches!(condition, Condition::None)).then_some(true);
                Ok(CqlRows { rows: Vec::new(), applied })
            }
            CqlStatement::Update { table, keys, assignments, condition } => {
                let t = tables.get_mut(table).ok_or_else(|| unconfigured(table))?;
                let existing = t.get(keys)?.cloned();
                let allowed = match (condition, &existing) {
                    (Condition::None, _) => true,
                    (Condition::Exists, current) => current.is_some(),
                    (Condition::NotExists, current) => current.is_none(),
                    (Condition::Equals(expected), Some(current)) => matches_expected(current, expected),
                    (Condition::Equals(_), None) => false,
                };
                let applied = (!matches!(condition, Condition::None)).then_some(allowed);
                if !allowed {
                    return Ok(CqlRows { rows: existing.into_iter().collect(), applied });
                }
                let mut target = existing.unwrap_or_else(|| keys.clone());
                for assignment in assignments {
                    match assignment {
                        Assignment::Set(col, v) => {
                            let mut one = Row::new();
                            one.insert(col.clone(), v.clone());
                            write_columns(&mut target, &one);
                        }
                        Assignment::Add(col, by) => {
                            let current = target.get(col).cloned().unwrap_or(Value::from(0));
                            target.insert(col.clone(), add_numbers(&current, by));
                        }
                    }
                }
                t.put(target)?;
                Ok(CqlRows { rows: Vec::new(), applied })
            }
            CqlStatement::Delete { table, keys, condition } => {
                let t = tables.get_mut(table).ok_or_else(|| unconfigured(table))?;
                let removed = t.remove(keys)?;
                let applied = (!matches!(condition, Condition::None)).then_some(removed);
                Ok(CqlRows { rows: Vec::new(), applied })
            }
            CqlStatement::Create { table, spec } => {
                if !tables.contains_key(table) {
                    if spec.keys().is_empty() {
                        return Err(CqlError::Invalid(format!("no PRIMARY KEY specified for table {table}")));
                    }
                    let keys = spec.keys();
                    tables.insert(
                        table.clone(),
                        MemTable { spec: spec.clone(), keys, partitions: BTreeMap::new() },
                    );
                }
                Ok(CqlRows::default())
            }
            CqlStatement::AddColumns { table, spec } => {
                let t = tables.get_mut(table).ok_or_else(|| unconfigured(table))?;
                for (name, col) in &spec.columns {
                    t.spec.columns.entry(name.clone()).or_insert_with(|| col.clone());
                }
                Ok(CqlRows::default())
            }
            CqlStatement::Drop { table } => {
                tables.remove(table);
                Ok(CqlRows::default())
            }
        }
    }
}

#[async_trait]
impl CqlSession for MemoryCql {
    async fn execute(&self, stmt: &CqlStatement) -> Result<CqlRows, CqlError> {
        self.run(stmt)
    }

    async fn tables(&self) -> Result<HashMap<String, TableInfo>, CqlError> {
        let tables = self.tables.lock();
        Ok(tables.iter().map(|(name, t)| (name.clone(), t.spec.to_info())).collect())
    }
}

#[cfg(feature = "cassandra")]
pub use scylla_session::ScyllaSession;

#[cfg(feature = "cassandra")]
mod scylla_session {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use scylla::frame::response::result::CqlValue;
    use scylla::transport::errors::{DbError, QueryError};
    use scylla::{Session, SessionBuilder};
    use serde_json::Value;

    use super::{CqlError, CqlRows, CqlSession};
    use crate::adapters::cassandra::cql::{quote, CqlStatement};
    use crate::request::Row;
    use crate::schema::{ColumnSpec, ColumnType, TableInfo};

    const APPLIED: &str = "[applied]";

    pub struct ScyllaSession {
        session: Session,
        keyspace: String,
    }

    impl ScyllaSession {
        /// Connect and switch to `keyspace`, creating it when missing.
        pub async fn connect(nodes: &[String], keyspace: &str) -> Result<Self, CqlError> {
            let session = SessionBuilder::new()
                .known_nodes(nodes)
                .build()
                .await
                .map_err(|e| CqlError::Connection(e.to_string()))?;
            let create = format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                quote(keyspace)
            );
            session.query(create, ()).await.map_err(convert)?;
            session.use_keyspace(keyspace, true).await.map_err(convert)?;
            Ok(Self { session, keyspace: keyspace.to_string() })
        }
    }

    fn convert(err: QueryError) -> CqlError {
        match err {
            QueryError::DbError(DbError::Unavailable { .. } | DbError::Overloaded | DbError::IsBootstrapping, msg) => {
                CqlError::Unavailable(msg)
            }
            QueryError::DbError(DbError::ReadTimeout { .. } | DbError::WriteTimeout { .. }, msg) => {
                CqlError::Timeout(msg)
            }
            QueryError::DbError(_, msg) => CqlError::Invalid(msg),
            QueryError::RequestTimeout(msg) => CqlError::Timeout(msg),
            other => CqlError::Connection(other.to_string()),
        }
    }

    fn to_cql(v: &Value) -> Option<CqlValue> {
        match v {
            Value::Null => None,
            Value::Bool(b) => Some(CqlValue::Boolean(*b)),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => CqlValue::BigInt(i),
                None => CqlValue::Double(n.as_f64().unwrap_or_default()),
            }),
            Value::String(s) => Some(CqlValue::Text(s.clone())),
            other => Some(CqlValue::Text(other.to_string())),
        }
    }

    fn from_cql(v: CqlValue) -> Value {
        match v {
            CqlValue::Text(s) | CqlValue::Ascii(s) => Value::String(s),
            CqlValue::Boolean(b) => Value::Bool(b),
            CqlValue::BigInt(i) => Value::from(i),
            CqlValue::Int(i) => Value::from(i),
            CqlValue::SmallInt(i) => Value::from(i),
            CqlValue::TinyInt(i) => Value::from(i),
            CqlValue::Counter(c) => Value::from(c.0),
            CqlValue::Double(f) => Value::from(f),
            CqlValue::Float(f) => Value::from(f64::from(f)),
            other => Value::String(format!("{other:?}")),
        }
    }

    #[async_trait]
    impl CqlSession for ScyllaSession {
        async fn execute(&self, stmt: &CqlStatement) -> Result<CqlRows, CqlError> {
            let mut out = CqlRows::default();
            for (cql, values) in stmt.render() {
                let values: Vec<Option<CqlValue>> = values.iter().map(to_cql).collect();
                let result = self.session.query(cql, values).await.map_err(convert)?;
                let names: Vec<String> = result.col_specs.iter().map(|c| c.name.clone()).collect();
                for row in result.rows.unwrap_or_default() {
                    let mut decoded = Row::new();
                    for (name, cell) in names.iter().zip(row.columns) {
                        let Some(cell) = cell else { continue };
                        if name == APPLIED {
                            out.applied = Some(matches!(cell, CqlValue::Boolean(true)));
                            continue;
                        }
                        decoded.insert(name.clone(), from_cql(cell));
                    }
                    if !decoded.is_empty() {
                        out.rows.push(decoded);
                    }
                }
            }
            Ok(out)
        }

        async fn tables(&self) -> Result<HashMap<String, TableInfo>, CqlError> {
            let result = self
                .session
                .query(
                    "SELECT table_name, column_name, kind, position, type FROM system_schema.columns \
                     WHERE keyspace_name = ?",
                    (self.keyspace.as_str(),),
                )
                .await
                .map_err(convert)?;
            let mut keyed: HashMap<String, Vec<(u8, i32, String)>> = HashMap::new();
            let mut tables: HashMap<String, TableInfo> = HashMap::new();
            for row in result.rows.unwrap_or_default() {
                let mut cells = row.columns.into_iter().map(|c| c.map(from_cql));
                let mut text = || match cells.next().flatten() {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let (table, column, kind, position, native) = (text(), text(), text(), text(), text());
                let info = tables.entry(table.clone()).or_default();
                info.columns.insert(column.clone(), ColumnSpec::of(ColumnType::from_native(&native)));
                let rank = match kind.as_str() {
                    "partition_key" => 0,
                    "clustering" => 1,
                    _ => continue,
                };
                keyed.entry(table).or_default().push((rank, position.parse().unwrap_or(0), column));
            }
            for (table, mut keys) in keyed {
                keys.sort();
                if let Some(info) = tables.get_mut(&table) {
                    info.keys = keys.into_iter().map(|(_, _, c)| c).collect();
                    for (pos, key) in info.keys.iter().enumerate() {
                        if let Some(col) = info.columns.get_mut(key) {
                            col.primary = Some(pos as u32 + 1);
                        }
                    }
                }
            }
            Ok(tables)
        }
    }
}
