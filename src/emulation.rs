// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row emulation helpers.
//!
//! Backends that cannot filter or sort on arbitrary fields (Cassandra,
//! CouchDB, Redis, Riak, LMDB) narrow with whatever native primitive they
//! have, then run the rows through the pure functions here. Filters and
//! sorts are plain values ([`RowFilter`], [`RowSort`]) built once by
//! `prepare` and interpreted here, so the same predicate gives the same
//! answer on every adapter.

use std::cmp::Ordering;

use serde_json::Value;

use crate::request::{FieldOp, Row};

/// Separator for composite keys inside ordered key/value stores.
///
/// Lower than every printable character, so string order of joined keys
/// matches tuple order of their parts.
pub const KEY_SEP: char = '\u{1}';

/// One `field <op> value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: FieldOp,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: FieldOp, value: Value) -> Self {
        Self { field: field.into(), op, value }
    }

    /// Evaluate against one row. Missing and null fields never match, as in SQL.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match row.get(&self.field) {
            None | Some(Value::Null) => false,
            Some(actual) => eval(self.op, actual, &self.value),
        }
    }
}

fn eval(op: FieldOp, actual: &Value, expected: &Value) -> bool {
    match op {
        FieldOp::Eq => values_equal(actual, expected),
        FieldOp::Ne => !values_equal(actual, expected),
        FieldOp::Gt => compare_values(actual, expected) == Ordering::Greater,
        FieldOp::Lt => compare_values(actual, expected) == Ordering::Less,
        FieldOp::Ge => compare_values(actual, expected) != Ordering::Less,
        FieldOp::Le => compare_values(actual, expected) != Ordering::Greater,
        FieldOp::BeginsWith => key_part(actual).starts_with(&key_part(expected)),
        FieldOp::Like => {
            let pattern = key_part(expected);
            match pattern.strip_suffix('%') {
                Some(prefix) => key_part(actual).starts_with(prefix),
                None => key_part(actual) == pattern,
            }
        }
        FieldOp::Between => match expected.as_array().map(Vec::as_slice) {
            Some([lo, hi]) => {
                compare_values(actual, lo) != Ordering::Less
                    && compare_values(actual, hi) != Ordering::Greater
            }
            _ => false,
        },
        FieldOp::In => match expected {
            Value::Array(items) => items.iter().any(|v| values_equal(actual, v)),
            single => values_equal(actual, single),
        },
    }
}

/// Conjunction of predicates. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    pub predicates: Vec<Predicate>,
}

impl RowFilter {
    #[must_use]
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }

    pub fn retain(&self, rows: &mut Vec<Row>) {
        if !self.is_empty() {
            rows.retain(|row| self.matches(row));
        }
    }

    /// Predicates on one field.
    pub fn on<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Predicate> + 'a {
        self.predicates.iter().filter(move |p| p.field == field)
    }
}

/// Comparator descriptor for an in-memory sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSort {
    pub field: String,
    pub desc: bool,
}

impl RowSort {
    pub fn new(field: impl Into<String>, desc: bool) -> Self {
        Self { field: field.into(), desc }
    }

    #[must_use]
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let null = Value::Null;
        let ord = compare_values(
            a.get(&self.field).unwrap_or(&null),
            b.get(&self.field).unwrap_or(&null),
        );
        if self.desc {
            ord.reverse()
        } else {
            ord
        }
    }

    pub fn apply(&self, rows: &mut [Row]) {
        rows.sort_unstable_by(|a, b| self.compare(a, b));
    }
}

fn rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
///
/// Numbers and numeric strings compare numerically, so a key stored as text
/// by one backend still compares equal to the number the caller passed.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => num(x).total_cmp(&num(y)),
        (Value::Number(x), Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(y) => num(x).total_cmp(&y),
            Err(_) => Ordering::Less,
        },
        (Value::String(s), Value::Number(y)) => match s.trim().parse::<f64>() {
            Ok(x) => x.total_cmp(&num(y)),
            Err(_) => Ordering::Greater,
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            Value::Object(x.clone()).to_string().cmp(&Value::Object(y.clone()).to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn num(n: &serde_json::Number) -> f64 {
    n.as_f64().unwrap_or(0.0)
}

#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Text form of a key component (strings unquoted).
#[must_use]
pub fn key_part(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Join key components with `sep`.
#[must_use]
pub fn join_key(parts: &[Value], sep: char) -> String {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.push_str(&key_part(part));
    }
    out
}

/// Keep only the `select` columns (all columns when none were requested).
#[must_use]
pub fn project(row: Row, select: Option<&[String]>) -> Row {
    match select {
        Some(fields) if !fields.is_empty() => row
            .into_iter()
            .filter(|(k, _)| fields.iter().any(|f| f == k))
            .collect(),
        _ => row,
    }
}

/// Apply `expected` as an equality predicate set.
#[must_use]
pub fn matches_expected(row: &Row, expected: &Row) -> bool {
    expected.iter().all(|(field, want)| match row.get(field) {
        Some(have) => values_equal(have, want),
        None => want.is_null(),
    })
}

/// Merge update fields into an existing row, adding `incr` fields numerically.
pub fn merge_row(target: &mut Row, changes: &Row, increment: bool) {
    for (field, value) in changes {
        if increment {
            let current = target.get(field).cloned().unwrap_or(Value::from(0));
            target.insert(field.clone(), add_numbers(&current, value));
        } else {
            target.insert(field.clone(), value.clone());
        }
    }
}

/// Numeric addition keeping integers integral.
#[must_use]
pub fn add_numbers(a: &Value, b: &Value) -> Value {
    let as_num = |v: &Value| -> Option<Value> {
        match v {
            Value::Number(_) => Some(v.clone()),
            Value::String(s) => serde_json::from_str::<Value>(s.trim()).ok().filter(Value::is_number),
            Value::Null => Some(Value::from(0)),
            _ => None,
        }
    };
    match (as_num(a), as_num(b)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Value::from(x.saturating_add(y)),
            _ => Value::from(num(&x) + num(&y)),
        },
        _ => b.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_comparison_operators() {
        let r = row(json!({"n": 5, "s": "hello"}));
        assert!(Predicate::new("n", FieldOp::Gt, json!(4)).matches(&r));
        assert!(!Predicate::new("n", FieldOp::Lt, json!(5)).matches(&r));
        assert!(Predicate::new("n", FieldOp::Le, json!(5)).matches(&r));
        assert!(Predicate::new("n", FieldOp::Ge, json!("5")).matches(&r));
        assert!(Predicate::new("n", FieldOp::Ne, json!(6)).matches(&r));
        assert!(Predicate::new("s", FieldOp::BeginsWith, json!("he")).matches(&r));
        assert!(Predicate::new("s", FieldOp::Like, json!("hel%")).matches(&r));
        assert!(!Predicate::new("s", FieldOp::Like, json!("hel")).matches(&r));
        assert!(Predicate::new("n", FieldOp::Between, json!([1, 5])).matches(&r));
        assert!(!Predicate::new("n", FieldOp::Between, json!([6, 9])).matches(&r));
        assert!(Predicate::new("s", FieldOp::In, json!(["x", "hello"])).matches(&r));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let r = row(json!({"a": 1}));
        assert!(!Predicate::new("b", FieldOp::Ne, json!(1)).matches(&r));
        assert!(!Predicate::new("b", FieldOp::Eq, json!(null)).matches(&r));
    }

    #[test]
    fn test_numeric_strings_compare_as_numbers() {
        assert_eq!(compare_values(&json!("10"), &json!(9)), Ordering::Greater);
        assert!(values_equal(&json!("1"), &json!(1)));
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
    }

    #[test]
    fn test_sort_descending() {
        let mut rows = vec![row(json!({"n": 1})), row(json!({"n": 3})), row(json!({"n": 2}))];
        RowSort::new("n", true).apply(&mut rows);
        let ns: Vec<i64> = rows.iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![3, 2, 1]);
    }

    #[test]
    fn test_joined_keys_keep_tuple_order() {
        let a = join_key(&[json!("a"), json!("z")], KEY_SEP);
        let b = join_key(&[json!("ab"), json!("a")], KEY_SEP);
        assert!(a < b);
    }

    #[test]
    fn test_project_and_expected() {
        let r = row(json!({"id": "1", "name": "a", "age": 3}));
        let p = project(r.clone(), Some(&["id".to_string(), "age".to_string()]));
        assert_eq!(Value::Object(p), json!({"id": "1", "age": 3}));
        assert!(matches_expected(&r, &row(json!({"name": "a"}))));
        assert!(!matches_expected(&r, &row(json!({"name": "b"}))));
    }

    #[test]
    fn test_merge_increment() {
        let mut r = row(json!({"hits": 2, "score": 1.5}));
        merge_row(&mut r, &row(json!({"hits": 3, "score": 1, "new": 4})), true);
        assert_eq!(Value::Object(r), json!({"hits": 5, "score": 2.5, "new": 4}));
    }
}
