// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table metadata: declared specs and per-pool introspection caches.
//!
//! Every pool keeps what it learned from its backend (`dbcolumns`,
//! `dbkeys`, `dbindexes` in one [`TableInfo`] per table) behind a
//! [`SchemaCache`]. Request preparation reads it to decide which fields are
//! keys, how to decode stored values and whether a table exists at all.
//!
//! # Example
//!
//! ```
//! use polystore::schema::{TableSpec, ColumnType};
//!
//! let spec = TableSpec::new()
//!     .primary("account_id", ColumnType::Text)
//!     .primary("mtime", ColumnType::Int)
//!     .column("status", ColumnType::Text)
//!     .indexed("email", ColumnType::Text);
//!
//! let info = spec.to_info();
//! assert_eq!(info.keys, vec!["account_id", "mtime"]);
//! assert_eq!(info.indexes["email"], vec!["email"]);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key assumed for tables nobody declared or introspected.
pub const DEFAULT_KEY: &str = "id";

/// Canonical form of a table name (used for cache prefixes and lookups).
#[must_use]
pub fn canonical_table(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    Text,
    Int,
    Real,
    Bool,
    /// Integer column only ever changed through `incr`.
    Counter,
    /// Objects and arrays, stored serialized where the backend has no native type.
    Json,
}

impl ColumnType {
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Real | Self::Counter)
    }

    /// Best guess from a native SQL/CQL type name.
    #[must_use]
    pub fn from_native(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("counter") {
            Self::Counter
        } else if name.contains("int") {
            Self::Int
        } else if name.contains("real")
            || name.contains("float")
            || name.contains("double")
            || name.contains("decimal")
            || name.contains("numeric")
        {
            Self::Real
        } else if name.contains("bool") {
            Self::Bool
        } else if name.contains("json") || name.starts_with("map") || name.starts_with("list") || name.starts_with("set") {
            Self::Json
        } else {
            Self::Text
        }
    }

    /// Decode a value that a backend stored as text.
    #[must_use]
    pub fn decode_text(&self, raw: &str) -> Value {
        match self {
            Self::Int | Self::Counter => raw
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| raw.parse::<f64>().map(Value::from))
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            Self::Real => raw
                .parse::<f64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            Self::Bool => match raw {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                other => Value::String(other.to_string()),
            },
            Self::Json => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
            Self::Text => Value::String(raw.to_string()),
        }
    }
}

/// Declared column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColumnSpec {
    #[serde(rename = "type", default)]
    pub kind: ColumnType,
    /// 1-based position in the primary key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<u32>,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ColumnSpec {
    #[must_use]
    pub fn of(kind: ColumnType) -> Self {
        Self { kind, ..Default::default() }
    }
}

/// Declared table: column name → spec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSpec {
    pub columns: BTreeMap<String, ColumnSpec>,
}

impl TableSpec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a primary key column (order of calls is key order).
    #[must_use]
    pub fn primary(mut self, name: &str, kind: ColumnType) -> Self {
        let pos = self.columns.values().filter(|c| c.primary.is_some()).count() as u32 + 1;
        self.columns.insert(
            name.to_string(),
            ColumnSpec { kind, primary: Some(pos), ..Default::default() },
        );
        self
    }

    #[must_use]
    pub fn column(mut self, name: &str, kind: ColumnType) -> Self {
        self.columns.insert(name.to_string(), ColumnSpec::of(kind));
        self
    }

    #[must_use]
    pub fn indexed(mut self, name: &str, kind: ColumnType) -> Self {
        self.columns.insert(
            name.to_string(),
            ColumnSpec { kind, index: true, ..Default::default() },
        );
        self
    }

    /// Primary key columns in key order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<(u32, &String)> = self
            .columns
            .iter()
            .filter_map(|(name, c)| c.primary.map(|p| (p, name)))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, n)| n.clone()).collect()
    }

    #[must_use]
    pub fn to_info(&self) -> TableInfo {
        let keys = self.keys();
        let indexes = self
            .columns
            .iter()
            .filter(|(_, c)| c.index)
            .map(|(name, _)| (name.clone(), vec![name.clone()]))
            .collect();
        TableInfo {
            columns: self.columns.clone(),
            keys: if keys.is_empty() { vec![DEFAULT_KEY.to_string()] } else { keys },
            indexes,
        }
    }
}

/// What a pool knows about one table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableInfo {
    /// `dbcolumns`
    pub columns: BTreeMap<String, ColumnSpec>,
    /// `dbkeys`, in key order
    pub keys: Vec<String>,
    /// `dbindexes`: index name → columns
    pub indexes: BTreeMap<String, Vec<String>>,
}

impl TableInfo {
    /// Info for a table nobody described: single `id` key, no columns.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            keys: vec![DEFAULT_KEY.to_string()],
            ..Default::default()
        }
    }

    #[must_use]
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns.get(name).map(|c| c.kind)
    }

    #[must_use]
    pub fn is_key(&self, name: &str) -> bool {
        self.keys.iter().any(|k| k == name)
    }

    /// Declared columns missing from `self` (input to add-column detection).
    #[must_use]
    pub fn missing_columns<'a>(&self, spec: &'a TableSpec) -> Vec<(&'a String, &'a ColumnSpec)> {
        spec.columns
            .iter()
            .filter(|(name, _)| !self.columns.contains_key(*name))
            .collect()
    }

    /// Overlay declared types on top of introspected ones.
    #[must_use]
    pub fn merged_with(&self, spec: &TableSpec) -> TableInfo {
        let declared = spec.to_info();
        let mut columns = self.columns.clone();
        for (name, col) in declared.columns {
            columns.insert(name, col);
        }
        let mut indexes = self.indexes.clone();
        indexes.extend(declared.indexes);
        let keys = if spec.keys().is_empty() && !self.keys.is_empty() {
            self.keys.clone()
        } else {
            declared.keys
        };
        TableInfo { columns, keys, indexes }
    }
}

/// Per-pool cache of introspected table metadata.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: RwLock<HashMap<String, Arc<TableInfo>>>,
}

impl SchemaCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything (result of `cache_columns`).
    pub fn replace(&self, tables: HashMap<String, TableInfo>) {
        let tables = tables
            .into_iter()
            .map(|(name, info)| (canonical_table(&name), Arc::new(info)))
            .collect();
        *self.tables.write() = tables;
    }

    pub fn insert(&self, table: &str, info: TableInfo) {
        self.tables.write().insert(canonical_table(table), Arc::new(info));
    }

    pub fn remove(&self, table: &str) {
        self.tables.write().remove(&canonical_table(table));
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<Arc<TableInfo>> {
        self.tables.read().get(&canonical_table(table)).cloned()
    }

    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.tables.read().contains_key(&canonical_table(table))
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_follow_primary_order() {
        let spec: TableSpec = serde_json::from_value(json!({
            "mtime": {"type": "int", "primary": 2},
            "account_id": {"primary": 1},
            "status": {}
        }))
        .unwrap();
        assert_eq!(spec.keys(), vec!["account_id", "mtime"]);
        assert_eq!(spec.columns["mtime"].kind, ColumnType::Int);
        assert_eq!(spec.columns["status"].kind, ColumnType::Text);
    }

    #[test]
    fn test_table_without_keys_defaults_to_id() {
        let info = TableSpec::new().column("name", ColumnType::Text).to_info();
        assert_eq!(info.keys, vec![DEFAULT_KEY]);
    }

    #[test]
    fn test_missing_columns_detection() {
        let existing = TableSpec::new()
            .primary("id", ColumnType::Text)
            .column("name", ColumnType::Text)
            .to_info();
        let declared = TableSpec::new()
            .primary("id", ColumnType::Text)
            .column("name", ColumnType::Text)
            .column("age", ColumnType::Int);
        let missing = existing.missing_columns(&declared);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, "age");
    }

    #[test]
    fn test_decode_text_by_type() {
        assert_eq!(ColumnType::Int.decode_text("42"), json!(42));
        assert_eq!(ColumnType::Real.decode_text("1.5"), json!(1.5));
        assert_eq!(ColumnType::Bool.decode_text("true"), json!(true));
        assert_eq!(ColumnType::Json.decode_text("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(ColumnType::Int.decode_text("abc"), json!("abc"));
    }

    #[test]
    fn test_native_type_mapping() {
        assert_eq!(ColumnType::from_native("BIGINT"), ColumnType::Int);
        assert_eq!(ColumnType::from_native("double precision"), ColumnType::Real);
        assert_eq!(ColumnType::from_native("counter"), ColumnType::Counter);
        assert_eq!(ColumnType::from_native("varchar(255)"), ColumnType::Text);
        assert_eq!(ColumnType::from_native("map<text, text>"), ColumnType::Json);
    }

    #[test]
    fn test_schema_cache_is_case_insensitive() {
        let cache = SchemaCache::new();
        cache.insert("Users", TableSpec::new().primary("id", ColumnType::Text).to_info());
        assert!(cache.contains("users"));
        assert!(cache.get("USERS").is_some());
        cache.remove("users");
        assert!(cache.table_names().is_empty());
    }

    #[test]
    fn test_merge_prefers_declared_types() {
        let introspected = TableInfo {
            columns: [("data".to_string(), ColumnSpec::of(ColumnType::Text))].into(),
            keys: vec!["id".to_string()],
            indexes: BTreeMap::new(),
        };
        let declared = TableSpec::new()
            .primary("id", ColumnType::Text)
            .column("data", ColumnType::Json);
        let merged = introspected.merged_with(&declared);
        assert_eq!(merged.column_type("data"), Some(ColumnType::Json));
        assert_eq!(merged.keys, vec!["id"]);
    }
}
