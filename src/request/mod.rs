// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The canonical request unit passed to every adapter.
//!
//! A [`Request`] is `{op, table, object, options}` exactly as it arrives from
//! the routing layer. Before it reaches a backend it is turned into an
//! immutable [`PreparedRequest`] by [`prepare()`], which resolves keys and
//! splits predicates into the part the backend can evaluate natively and the
//! part that must be emulated in memory.
//!
//! # Example
//!
//! ```
//! use polystore::request::{Request, Op, FieldOp};
//! use serde_json::json;
//!
//! let req = Request::new(Op::Select, "messages", json!({"account_id": "a1", "mtime": 100}))
//!     .with_op("mtime", FieldOp::Gt)
//!     .count(10);
//!
//! assert_eq!(req.options.count, Some(10));
//! assert_eq!(req.field_op("mtime"), FieldOp::Gt);
//! assert_eq!(req.field_op("account_id"), FieldOp::Eq);
//! ```

mod prepare;

pub use prepare::{prepare, Capabilities, NativeFilter, NativeSort, PreparedRequest};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DbError;

/// One record: field → value.
pub type Row = serde_json::Map<String, Value>;

/// Field under which `list` accepts an array of key objects.
pub const LIST_FIELD: &str = "$list";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Get,
    Select,
    Add,
    Put,
    Update,
    Incr,
    Del,
    List,
    Create,
    Upgrade,
    Drop,
}

impl Op {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Select => "select",
            Self::Add => "add",
            Self::Put => "put",
            Self::Update => "update",
            Self::Incr => "incr",
            Self::Del => "del",
            Self::List => "list",
            Self::Create => "create",
            Self::Upgrade => "upgrade",
            Self::Drop => "drop",
        }
    }

    /// Record mutations (the ones the cache layer invalidates on).
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Add | Self::Put | Self::Update | Self::Incr | Self::Del)
    }

    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get | Self::Select | Self::List)
    }

    #[must_use]
    pub fn is_schema(&self) -> bool {
        matches!(self, Self::Create | Self::Upgrade | Self::Drop)
    }

    /// Ops addressing exactly one record by its full primary key.
    #[must_use]
    pub fn needs_full_key(&self) -> bool {
        matches!(self, Self::Get | Self::Add | Self::Put | Self::Update | Self::Incr | Self::Del)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "get" => Self::Get,
            "select" | "search" => Self::Select,
            "add" | "insert" => Self::Add,
            "put" | "replace" => Self::Put,
            "update" => Self::Update,
            "incr" => Self::Incr,
            "del" | "delete" => Self::Del,
            "list" => Self::List,
            "create" => Self::Create,
            "upgrade" => Self::Upgrade,
            "drop" => Self::Drop,
            other => return Err(DbError::invalid(format!("unknown op '{other}'"))),
        })
    }
}

/// Per-field comparison operator (`options.ops`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FieldOp {
    #[default]
    #[serde(rename = "eq", alias = "=")]
    Eq,
    #[serde(rename = "ne", alias = "!=", alias = "<>")]
    Ne,
    #[serde(rename = "gt", alias = ">")]
    Gt,
    #[serde(rename = "lt", alias = "<")]
    Lt,
    #[serde(rename = "ge", alias = ">=")]
    Ge,
    #[serde(rename = "le", alias = "<=")]
    Le,
    #[serde(rename = "begins_with")]
    BeginsWith,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "like%", alias = "like")]
    Like,
}

impl FieldOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Ge => "ge",
            Self::Le => "le",
            Self::BeginsWith => "begins_with",
            Self::Between => "between",
            Self::In => "in",
            Self::Like => "like%",
        }
    }

    /// Range operators usable on an ordered key.
    #[must_use]
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Gt | Self::Lt | Self::Ge | Self::Le | Self::Between)
    }

    /// Prefix operators (`begins_with`, `like%`).
    #[must_use]
    pub fn is_prefix(&self) -> bool {
        matches!(self, Self::BeginsWith | Self::Like)
    }
}

impl FromStr for FieldOp {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_lowercase()))
            .map_err(|_| DbError::invalid(format!("unknown operator '{s}'")))
    }
}

/// Request options, mirroring the external JSON shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    pub desc: bool,
    /// Opaque pagination token from a previous `next_token`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    pub ops: HashMap<String, FieldOp>,
    /// Optimistic-concurrency predicate for `update`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key_name: Option<String>,
    /// Positive: shared-tier TTL in ms. Negative: local-tier TTL in ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<i64>,
    /// Pool whose cache configuration applies (defaults to the target pool).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_name: Option<String>,
    /// Target pool name or alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    /// `update`/`del` fail with `InvalidId` when the record is missing.
    pub must_exist: bool,
    /// Version token (Riak vclock, CouchDB `_rev`) for the next write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Bypass the cache layer entirely.
    pub no_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub op: Op,
    pub table: String,
    #[serde(default)]
    pub object: Row,
    #[serde(default)]
    pub options: QueryOptions,
}

impl Request {
    /// Build a request; a non-object `object` becomes an empty row.
    pub fn new(op: Op, table: impl Into<String>, object: Value) -> Self {
        let object = match object {
            Value::Object(map) => map,
            _ => Row::new(),
        };
        Self {
            op,
            table: table.into(),
            object,
            options: QueryOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_op(mut self, field: &str, op: FieldOp) -> Self {
        self.options.ops.insert(field.to_string(), op);
        self
    }

    #[must_use]
    pub fn count(mut self, count: usize) -> Self {
        self.options.count = Some(count);
        self
    }

    #[must_use]
    pub fn start(mut self, token: Option<Value>) -> Self {
        self.options.start = token;
        self
    }

    #[must_use]
    pub fn sort(mut self, field: &str, desc: bool) -> Self {
        self.options.sort = Some(field.to_string());
        self.options.desc = desc;
        self
    }

    #[must_use]
    pub fn select(mut self, fields: &[&str]) -> Self {
        self.options.select = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    #[must_use]
    pub fn expected(mut self, expected: Value) -> Self {
        if let Value::Object(map) = expected {
            self.options.expected = Some(map);
        }
        self
    }

    #[must_use]
    pub fn pool(mut self, pool: &str) -> Self {
        self.options.pool = Some(pool.to_string());
        self
    }

    #[must_use]
    pub fn must_exist(mut self) -> Self {
        self.options.must_exist = true;
        self
    }

    /// Declared operator for a field, `eq` when none was given.
    #[must_use]
    pub fn field_op(&self, field: &str) -> FieldOp {
        self.options.ops.get(field).copied().unwrap_or_default()
    }
}

/// Result metadata returned next to the rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<Value>,
    /// 0 = not from cache, 1 = local tier, 2 = shared tier.
    pub cached: u8,
    /// Version token of the single row read (Riak vclock, CouchDB `_rev`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub info: QueryInfo,
}

impl QueryResult {
    #[must_use]
    pub fn rows(rows: Vec<Row>) -> Self {
        Self { rows, info: QueryInfo::default() }
    }

    #[must_use]
    pub fn affected(n: u64) -> Self {
        Self {
            rows: Vec::new(),
            info: QueryInfo { affected_rows: Some(n), ..Default::default() },
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// First row, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    #[must_use]
    pub fn affected_rows(&self) -> u64 {
        self.info.affected_rows.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_from_external_json() {
        let req: Request = serde_json::from_value(json!({
            "op": "select",
            "table": "messages",
            "object": {"account_id": "a1", "mtime": [1, 5]},
            "options": {
                "ops": {"mtime": "between", "name": "like%"},
                "count": 10,
                "cacheKeyName": "email",
                "cacheTtl": -500,
                "desc": true
            }
        }))
        .unwrap();

        assert_eq!(req.op, Op::Select);
        assert_eq!(req.field_op("mtime"), FieldOp::Between);
        assert_eq!(req.field_op("name"), FieldOp::Like);
        assert_eq!(req.options.cache_key_name.as_deref(), Some("email"));
        assert_eq!(req.options.cache_ttl, Some(-500));
        assert!(req.options.desc);
    }

    #[test]
    fn test_operator_aliases() {
        assert_eq!("gt".parse::<FieldOp>().unwrap(), FieldOp::Gt);
        assert_eq!(">=".parse::<FieldOp>().unwrap(), FieldOp::Ge);
        assert_eq!("like".parse::<FieldOp>().unwrap(), FieldOp::Like);
        assert_eq!("BEGINS_WITH".parse::<FieldOp>().unwrap(), FieldOp::BeginsWith);
        assert!("regex".parse::<FieldOp>().is_err());
    }

    #[test]
    fn test_op_parsing_and_classes() {
        assert_eq!("delete".parse::<Op>().unwrap(), Op::Del);
        assert!(Op::Incr.is_write());
        assert!(Op::List.is_read());
        assert!(Op::Upgrade.is_schema());
        assert!(!Op::Select.needs_full_key());
        assert!("frobnicate".parse::<Op>().is_err());
    }

    #[test]
    fn test_non_object_becomes_empty_row() {
        let req = Request::new(Op::Get, "t", json!("nope"));
        assert!(req.object.is_empty());
    }

    #[test]
    fn test_info_serialization_skips_empty() {
        let info = QueryInfo { affected_rows: Some(1), ..Default::default() };
        assert_eq!(serde_json::to_value(&info).unwrap(), json!({"affected_rows": 1, "cached": 0}));
    }
}
