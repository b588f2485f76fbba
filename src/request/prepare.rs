// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request preparation.
//!
//! [`prepare`] is pure: it reads a [`Request`], the table metadata and the
//! adapter's [`Capabilities`], and returns an immutable [`PreparedRequest`].
//! A field goes to native lookup only when it is a backend key *and* its
//! operator is one the backend evaluates natively. Everything else becomes
//! a [`RowFilter`] evaluated in memory. Malformed input (missing key fields,
//! non-numeric `incr`, bad `between`) is rejected here, before any native
//! call.

use std::sync::Arc;

use serde_json::Value;

use super::{FieldOp, Op, QueryOptions, Request, Row, LIST_FIELD};
use crate::emulation::{self, Predicate, RowFilter, RowSort};
use crate::error::{DbError, Result};
use crate::schema::{canonical_table, TableInfo};

/// Operators every key-addressed backend can evaluate on its key.
pub const KEY_OPS: &[FieldOp] = &[FieldOp::Eq, FieldOp::BeginsWith, FieldOp::Like];

/// How much filtering a backend does itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeFilter {
    /// Arbitrary predicates on any column (SQL, MongoDB).
    All,
    /// Only key fields with one of `key_ops`.
    Keys,
}

/// Which sort requests a backend honours natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeSort {
    Any,
    /// Only the key at this position (Cassandra: first clustering key).
    KeyAt(usize),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub filter: NativeFilter,
    pub key_ops: &'static [FieldOp],
    pub sort: NativeSort,
}

impl Capabilities {
    /// Full query language.
    pub const NATIVE: Capabilities = Capabilities {
        filter: NativeFilter::All,
        key_ops: &[],
        sort: NativeSort::Any,
    };

    /// Key lookup only; everything else emulated.
    pub const KEYED: Capabilities = Capabilities {
        filter: NativeFilter::Keys,
        key_ops: KEY_OPS,
        sort: NativeSort::None,
    };

    fn is_native(&self, info: &TableInfo, field: &str, op: FieldOp) -> bool {
        match self.filter {
            NativeFilter::All => true,
            NativeFilter::Keys => info.is_key(field) && self.key_ops.contains(&op),
        }
    }

    fn sorts_natively(&self, keys: &[String], field: &str) -> bool {
        match self.sort {
            NativeSort::Any => true,
            NativeSort::KeyAt(pos) => keys.get(pos).is_some_and(|k| k == field),
            NativeSort::None => false,
        }
    }
}

/// Immutable request handed to an adapter's native-call step.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub op: Op,
    /// Canonical table name.
    pub table: String,
    pub object: Row,
    pub options: QueryOptions,
    pub info: Arc<TableInfo>,
    /// Ordered primary key fields.
    pub keys: Vec<String>,
    /// Predicates the backend evaluates in its native lookup.
    pub conditions: Vec<Predicate>,
    /// Predicates evaluated in memory after fetch.
    pub filter: RowFilter,
    /// Sort the backend performs itself.
    pub native_sort: Option<RowSort>,
    /// Sort performed in memory after fetch.
    pub sort: Option<RowSort>,
    pub start: Option<Value>,
    pub count: Option<usize>,
    /// Key rows for `list`.
    pub list: Vec<Row>,
}

impl PreparedRequest {
    /// Values of the primary key fields, in key order.
    #[must_use]
    pub fn key_values(&self) -> Vec<Value> {
        self.keys_of(&self.object)
    }

    /// Primary key values of any row of this table.
    #[must_use]
    pub fn keys_of(&self, row: &Row) -> Vec<Value> {
        self.keys
            .iter()
            .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// The primary key fields of the input as a row.
    #[must_use]
    pub fn key_row(&self) -> Row {
        self.keys
            .iter()
            .filter_map(|k| self.object.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Non-key fields of the input (what a write changes).
    #[must_use]
    pub fn data(&self) -> Row {
        self.object
            .iter()
            .filter(|(k, _)| !self.info.is_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Every predicate, native or not. Emulating adapters re-check the rows
    /// their native narrowing returned with this.
    #[must_use]
    pub fn full_filter(&self) -> RowFilter {
        let mut predicates = self.conditions.clone();
        predicates.extend(self.filter.predicates.iter().cloned());
        RowFilter::new(predicates)
    }

    /// Leading key values fixed by `eq` conditions, plus the prefix
    /// condition on the next key when there is one.
    #[must_use]
    pub fn key_prefix(&self) -> (Vec<Value>, Option<&Predicate>) {
        let mut fixed = Vec::new();
        for key in &self.keys {
            let mut conds = self.conditions.iter().filter(|p| &p.field == key);
            match conds.find(|p| p.op == FieldOp::Eq) {
                Some(eq) => fixed.push(eq.value.clone()),
                None => {
                    let prefix = self
                        .conditions
                        .iter()
                        .find(|p| &p.field == key && p.op.is_prefix());
                    return (fixed, prefix);
                }
            }
        }
        (fixed, None)
    }

    /// Apply the emulated sort and projection to a fetched page.
    #[must_use]
    pub fn finish(&self, mut rows: Vec<Row>) -> Vec<Row> {
        if let Some(sort) = &self.sort {
            sort.apply(&mut rows);
        }
        let select = self.options.select.as_deref();
        rows.into_iter().map(|r| emulation::project(r, select)).collect()
    }

    /// Whether a page of `len` rows is full (and so may have a successor).
    #[must_use]
    pub fn page_full(&self, len: usize) -> bool {
        self.count.is_some_and(|c| c > 0 && len >= c)
    }
}

/// Build the prepared form of `req` for a backend with `caps`.
pub fn prepare(req: &Request, info: Arc<TableInfo>, caps: &Capabilities) -> Result<PreparedRequest> {
    let table = canonical_table(&req.table);
    if table.is_empty() && !matches!(req.op, Op::Create | Op::Upgrade | Op::Drop) {
        return Err(DbError::invalid("table name is required"));
    }
    let keys = info.keys.clone();

    if req.op.needs_full_key() {
        for key in &keys {
            if req.object.get(key).map_or(true, Value::is_null) {
                return Err(DbError::invalid(format!(
                    "missing key field '{key}' for {} on '{table}'",
                    req.op
                )));
            }
        }
    }

    if req.op == Op::Incr {
        for (field, value) in &req.object {
            if !info.is_key(field) && !value.is_number() {
                return Err(DbError::invalid(format!("incr field '{field}' is not numeric")));
            }
        }
    }

    let mut conditions = Vec::new();
    let mut deferred = Vec::new();
    if req.op == Op::Select {
        for (field, value) in &req.object {
            if value.is_null() {
                continue;
            }
            let mut op = req.field_op(field);
            if op == FieldOp::Eq && value.is_array() {
                op = FieldOp::In;
            }
            if op == FieldOp::Between && value.as_array().map_or(true, |a| a.len() != 2) {
                return Err(DbError::invalid(format!("between on '{field}' needs two values")));
            }
            let pred = Predicate::new(field.clone(), op, value.clone());
            if caps.is_native(&info, field, op) {
                conditions.push(pred);
            } else {
                deferred.push(pred);
            }
        }
    }

    let (native_sort, sort) = match &req.options.sort {
        Some(field) if caps.sorts_natively(&keys, field) => {
            (Some(RowSort::new(field.clone(), req.options.desc)), None)
        }
        Some(field) => (None, Some(RowSort::new(field.clone(), req.options.desc))),
        None => (None, None),
    };

    let list = if req.op == Op::List { list_keys(req, &keys)? } else { Vec::new() };

    Ok(PreparedRequest {
        op: req.op,
        table,
        object: req.object.clone(),
        options: req.options.clone(),
        info,
        keys,
        conditions,
        filter: RowFilter::new(deferred),
        native_sort,
        sort,
        start: req.options.start.clone().filter(|s| !s.is_null()),
        count: req.options.count,
        list,
    })
}

fn list_keys(req: &Request, keys: &[String]) -> Result<Vec<Row>> {
    if let Some(Value::Array(items)) = req.object.get(LIST_FIELD) {
        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Object(map) => rows.push(map.clone()),
                other if keys.len() == 1 => {
                    rows.push(Row::from_iter([(keys[0].clone(), other.clone())]));
                }
                _ => return Err(DbError::invalid("list items must be key objects")),
            }
        }
        return check_list(rows, keys);
    }
    if keys.len() == 1 {
        if let Some(Value::Array(items)) = req.object.get(&keys[0]) {
            let rows = items
                .iter()
                .map(|v| Row::from_iter([(keys[0].clone(), v.clone())]))
                .collect();
            return check_list(rows, keys);
        }
    }
    check_list(vec![req.object.clone()], keys)
}

fn check_list(rows: Vec<Row>, keys: &[String]) -> Result<Vec<Row>> {
    for row in &rows {
        if let Some(key) = keys.iter().find(|k| row.get(*k).map_or(true, Value::is_null)) {
            return Err(DbError::invalid(format!("list item is missing key field '{key}'")));
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, TableSpec};
    use serde_json::json;

    fn messages() -> Arc<TableInfo> {
        Arc::new(
            TableSpec::new()
                .primary("account_id", ColumnType::Text)
                .primary("mtime", ColumnType::Int)
                .column("status", ColumnType::Text)
                .to_info(),
        )
    }

    #[test]
    fn test_keyed_backend_defers_non_key_and_range() {
        let req = Request::new(
            Op::Select,
            "Messages",
            json!({"account_id": "a1", "mtime": 100, "status": "new"}),
        )
        .with_op("mtime", FieldOp::Gt);

        let p = prepare(&req, messages(), &Capabilities::KEYED).unwrap();
        assert_eq!(p.table, "messages");
        assert_eq!(p.conditions, vec![Predicate::new("account_id", FieldOp::Eq, json!("a1"))]);
        let deferred: Vec<&str> = p.filter.predicates.iter().map(|p| p.field.as_str()).collect();
        assert_eq!(deferred.len(), 2);
        assert!(deferred.contains(&"mtime"));
        assert!(deferred.contains(&"status"));
        assert_eq!(p.full_filter().predicates.len(), 3);
    }

    #[test]
    fn test_native_backend_keeps_everything() {
        let req = Request::new(Op::Select, "messages", json!({"status": "new"})).sort("status", true);
        let p = prepare(&req, messages(), &Capabilities::NATIVE).unwrap();
        assert_eq!(p.conditions.len(), 1);
        assert!(p.filter.is_empty());
        assert_eq!(p.native_sort, Some(RowSort::new("status", true)));
        assert!(p.sort.is_none());
    }

    #[test]
    fn test_sort_on_clustering_key_only() {
        let caps = Capabilities { sort: NativeSort::KeyAt(1), ..Capabilities::KEYED };
        let on_key = Request::new(Op::Select, "messages", json!({"account_id": "a"})).sort("mtime", false);
        let p = prepare(&on_key, messages(), &caps).unwrap();
        assert!(p.native_sort.is_some() && p.sort.is_none());

        let other = Request::new(Op::Select, "messages", json!({"account_id": "a"})).sort("status", false);
        let p = prepare(&other, messages(), &caps).unwrap();
        assert!(p.native_sort.is_none() && p.sort.is_some());
    }

    #[test]
    fn test_missing_key_fails_fast() {
        let req = Request::new(Op::Get, "messages", json!({"account_id": "a1"}));
        let err = prepare(&req, messages(), &Capabilities::KEYED).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput(_)));
    }

    #[test]
    fn test_incr_requires_numbers() {
        let req = Request::new(Op::Incr, "messages", json!({"account_id": "a", "mtime": 1, "status": "x"}));
        assert!(prepare(&req, messages(), &Capabilities::KEYED).is_err());
    }

    #[test]
    fn test_array_value_becomes_in() {
        let info = Arc::new(TableInfo::unknown());
        let req = Request::new(Op::Select, "t", json!({"name": ["a", "b"]}));
        let p = prepare(&req, info, &Capabilities::KEYED).unwrap();
        assert_eq!(p.filter.predicates[0].op, FieldOp::In);
    }

    #[test]
    fn test_key_prefix() {
        let req = Request::new(Op::Select, "messages", json!({"account_id": "a1", "mtime": "1"}))
            .with_op("mtime", FieldOp::BeginsWith);
        let p = prepare(&req, messages(), &Capabilities::KEYED).unwrap();
        let (fixed, tail) = p.key_prefix();
        assert_eq!(fixed, vec![json!("a1")]);
        assert_eq!(tail.map(|t| t.field.as_str()), Some("mtime"));
    }

    #[test]
    fn test_list_forms() {
        let info = Arc::new(TableInfo::unknown());
        let by_array = Request::new(Op::List, "t", json!({"id": ["1", "2", "3"]}));
        let p = prepare(&by_array, info.clone(), &Capabilities::KEYED).unwrap();
        assert_eq!(p.list.len(), 3);

        let by_objects = Request::new(Op::List, "messages", json!({"$list": [
            {"account_id": "a", "mtime": 1},
            {"account_id": "a", "mtime": 2}
        ]}));
        let p = prepare(&by_objects, messages(), &Capabilities::KEYED).unwrap();
        assert_eq!(p.list.len(), 2);

        let broken = Request::new(Op::List, "messages", json!({"$list": [{"account_id": "a"}]}));
        assert!(prepare(&broken, messages(), &Capabilities::KEYED).is_err());
    }
}
