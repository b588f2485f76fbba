// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL text generation.
//!
//! Everything here is pure: a [`PreparedRequest`] goes in, a statement with
//! positional arguments comes out. Identifiers are always quoted and values
//! always bound, never interpolated.

use serde_json::Value;

use crate::emulation::{key_part, Predicate};
use crate::error::{DbError, Result};
use crate::request::{FieldOp, PreparedRequest, Row};
use crate::schema::{ColumnSpec, ColumnType, TableInfo, TableSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
    Postgres,
}

impl Dialect {
    /// Dialect from a connection URL scheme (`sqlite:`, `mysql:`, `postgres:`).
    #[must_use]
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "sqlite" => Some(Self::Sqlite),
            "mysql" | "mariadb" => Some(Self::Mysql),
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }

    #[must_use]
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Self::Mysql => format!("`{}`", ident.replace('`', "``")),
            Self::Sqlite | Self::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::Sqlite | Self::Mysql => "?".to_string(),
        }
    }

    fn column_type(&self, col: &ColumnSpec) -> &'static str {
        let short_text = col.primary.is_some() || col.index;
        match (self, col.kind) {
            (Self::Sqlite, ColumnType::Int | ColumnType::Counter | ColumnType::Bool) => "INTEGER",
            (Self::Sqlite, ColumnType::Real) => "REAL",
            (Self::Sqlite, ColumnType::Text | ColumnType::Json) => "TEXT",
            (Self::Postgres, ColumnType::Int | ColumnType::Counter) => "BIGINT",
            (Self::Postgres, ColumnType::Real) => "DOUBLE PRECISION",
            (Self::Postgres, ColumnType::Bool) => "BOOLEAN",
            (Self::Postgres, ColumnType::Text | ColumnType::Json) => "TEXT",
            (Self::Mysql, ColumnType::Int | ColumnType::Counter) => "BIGINT",
            (Self::Mysql, ColumnType::Real) => "DOUBLE",
            (Self::Mysql, ColumnType::Bool) => "TINYINT",
            (Self::Mysql, ColumnType::Text) if short_text => "VARCHAR(255)",
            (Self::Mysql, ColumnType::Text) => "TEXT",
            // The Any driver has no JSON type mapping.
            (Self::Mysql, ColumnType::Json) => "LONGTEXT",
        }
    }
}

/// One bound argument.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

impl SqlArg {
    /// Argument for `value`, coerced to the declared column type when known.
    #[must_use]
    pub fn for_column(value: &Value, kind: Option<ColumnType>) -> Self {
        match (value, kind) {
            (Value::Null, _) => Self::Null,
            (Value::Object(_) | Value::Array(_), _) => Self::Text(value.to_string()),
            (_, Some(ColumnType::Text | ColumnType::Json)) => Self::Text(key_part(value)),
            (Value::String(s), Some(ColumnType::Int | ColumnType::Counter)) => match s.trim().parse::<i64>() {
                Ok(n) => Self::Int(n),
                Err(_) => Self::Text(s.clone()),
            },
            (Value::String(s), Some(ColumnType::Real)) => match s.trim().parse::<f64>() {
                Ok(n) => Self::Real(n),
                Err(_) => Self::Text(s.clone()),
            },
            (Value::Bool(b), Some(ColumnType::Int | ColumnType::Counter)) => Self::Int(i64::from(*b)),
            (Value::Number(n), Some(ColumnType::Bool)) => Self::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            (Value::Bool(b), _) => Self::Bool(*b),
            (Value::Number(n), _) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Real(n.as_f64().unwrap_or_default()),
            },
            (Value::String(s), _) => Self::Text(s.clone()),
        }
    }
}

/// Statement text plus its arguments in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

struct Builder<'a> {
    dialect: Dialect,
    info: &'a TableInfo,
    sql: String,
    args: Vec<SqlArg>,
}

impl<'a> Builder<'a> {
    fn new(dialect: Dialect, info: &'a TableInfo) -> Self {
        Self { dialect, info, sql: String::new(), args: Vec::new() }
    }

    fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    fn ident(&mut self, name: &str) -> &mut Self {
        let quoted = self.dialect.quote(name);
        self.sql.push_str(&quoted);
        self
    }

    fn arg(&mut self, column: &str, value: &Value) -> &mut Self {
        self.args.push(SqlArg::for_column(value, self.info.column_type(column)));
        let ph = self.dialect.placeholder(self.args.len());
        self.sql.push_str(&ph);
        self
    }

    fn raw_arg(&mut self, arg: SqlArg) -> &mut Self {
        self.args.push(arg);
        let ph = self.dialect.placeholder(self.args.len());
        self.sql.push_str(&ph);
        self
    }

    /// `a = ? AND b = ?` over `fields`, taken from `row`.
    fn equalities(&mut self, fields: &[String], row: &Row) -> &mut Self {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                self.push(" AND ");
            }
            match row.get(field) {
                None | Some(Value::Null) => {
                    self.ident(field).push(" IS NULL");
                }
                Some(value) => {
                    self.ident(field).push(" = ").arg(field, value);
                }
            }
        }
        self
    }

    fn predicate(&mut self, p: &Predicate) -> Result<&mut Self> {
        let field = p.field.as_str();
        let op = match p.op {
            FieldOp::Eq => "=",
            FieldOp::Ne => "<>",
            FieldOp::Gt => ">",
            FieldOp::Lt => "<",
            FieldOp::Ge => ">=",
            FieldOp::Le => "<=",
            FieldOp::BeginsWith => {
                self.text_match(field, &key_part(&p.value), true);
                return Ok(self);
            }
            FieldOp::Like => {
                let pattern = key_part(&p.value);
                match pattern.strip_suffix('%') {
                    Some(prefix) => self.text_match(field, prefix, true),
                    None => self.text_match(field, &pattern, false),
                };
                return Ok(self);
            }
            FieldOp::Between => {
                let Some([lo, hi]) = p.value.as_array().map(Vec::as_slice) else {
                    return Err(DbError::invalid(format!("between on '{field}' needs two values")));
                };
                self.ident(field).push(" BETWEEN ").arg(field, lo).push(" AND ").arg(field, hi);
                return Ok(self);
            }
            FieldOp::In => {
                let items = match &p.value {
                    Value::Array(items) => items.clone(),
                    single => vec![single.clone()],
                };
                if items.is_empty() {
                    self.push("1 = 0");
                    return Ok(self);
                }
                self.ident(field).push(" IN (");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.arg(field, item);
                }
                self.push(")");
                return Ok(self);
            }
        };
        self.ident(field).push(" ").push(op).push(" ").arg(field, &p.value);
        Ok(self)
    }

    /// Case-sensitive literal comparison of the column's text form with
    /// `text`, or with its first characters when `prefix` is set. `LIKE` is
    /// avoided: it treats `%` and `_` as wildcards and ignores ASCII case on
    /// SQLite and MySQL.
    fn text_match(&mut self, field: &str, text: &str, prefix: bool) -> &mut Self {
        let cast = if self.dialect == Dialect::Mysql { "CHAR" } else { "TEXT" };
        let binary = self.dialect == Dialect::Mysql;
        if binary {
            self.push("CAST(");
        }
        if prefix {
            self.push("SUBSTR(");
        }
        self.push("CAST(").ident(field).push(&format!(" AS {cast})"));
        if prefix {
            self.push(&format!(", 1, {})", text.chars().count()));
        }
        if binary {
            self.push(" AS BINARY) = CAST(").raw_arg(SqlArg::Text(text.to_string())).push(" AS BINARY)");
        } else {
            self.push(" = ").raw_arg(SqlArg::Text(text.to_string()));
        }
        self
    }

    fn columns(&mut self, select: Option<&[String]>) -> &mut Self {
        match select {
            Some(fields) if !fields.is_empty() => {
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.ident(field);
                }
            }
            _ => {
                self.push("*");
            }
        }
        self
    }

    fn finish(self) -> SqlQuery {
        SqlQuery { sql: self.sql, args: self.args }
    }
}

/// Paged `SELECT` with native WHERE, ORDER BY and LIMIT/OFFSET.
pub fn select(d: Dialect, req: &PreparedRequest, offset: usize) -> Result<SqlQuery> {
    let mut b = Builder::new(d, &req.info);
    b.push("SELECT ").columns(req.options.select.as_deref()).push(" FROM ").ident(&req.table);
    for (i, cond) in req.conditions.iter().enumerate() {
        b.push(if i == 0 { " WHERE " } else { " AND " });
        b.predicate(cond)?;
    }

    // Offsets are only stable under a total order, so keys always break ties.
    b.push(" ORDER BY ");
    let dir = if req.options.desc { " DESC" } else { "" };
    let mut first = true;
    if let Some(sort) = &req.native_sort {
        b.ident(&sort.field).push(if sort.desc { " DESC" } else { "" });
        first = false;
    }
    for key in &req.keys {
        if req.native_sort.as_ref().is_some_and(|s| &s.field == key) {
            continue;
        }
        if !first {
            b.push(", ");
        }
        b.ident(key).push(dir);
        first = false;
    }

    match (req.count.filter(|c| *c > 0), offset) {
        (Some(count), offset) => {
            b.push(&format!(" LIMIT {count}"));
            if offset > 0 {
                b.push(&format!(" OFFSET {offset}"));
            }
        }
        (None, 0) => {}
        (None, offset) => {
            // Every dialect wants a LIMIT before OFFSET.
            let limit = match d {
                Dialect::Postgres => "ALL".to_string(),
                Dialect::Sqlite => "-1".to_string(),
                Dialect::Mysql => u64::MAX.to_string(),
            };
            b.push(&format!(" LIMIT {limit} OFFSET {offset}"));
        }
    }
    Ok(b.finish())
}

/// Single row by full primary key.
pub fn get(d: Dialect, req: &PreparedRequest) -> SqlQuery {
    let mut b = Builder::new(d, &req.info);
    b.push("SELECT ").columns(req.options.select.as_deref()).push(" FROM ").ident(&req.table);
    b.push(" WHERE ").equalities(&req.keys, &req.object).push(" LIMIT 1");
    b.finish()
}

/// Multi-get: `k IN (...)` for single keys, OR-ed key tuples otherwise.
pub fn list(d: Dialect, req: &PreparedRequest) -> SqlQuery {
    let mut b = Builder::new(d, &req.info);
    b.push("SELECT ").columns(req.options.select.as_deref()).push(" FROM ").ident(&req.table);
    if req.list.is_empty() {
        b.push(" WHERE 1 = 0");
        return b.finish();
    }
    b.push(" WHERE ");
    if let [key] = req.keys.as_slice() {
        b.ident(key).push(" IN (");
        for (i, row) in req.list.iter().enumerate() {
            if i > 0 {
                b.push(", ");
            }
            b.arg(key, row.get(key).unwrap_or(&Value::Null));
        }
        b.push(")");
    } else {
        for (i, row) in req.list.iter().enumerate() {
            if i > 0 {
                b.push(" OR ");
            }
            b.push("(").equalities(&req.keys, row).push(")");
        }
    }
    b.finish()
}

/// `INSERT` (`add`) or full-row replace (`put`).
pub fn insert(d: Dialect, req: &PreparedRequest, replace: bool) -> SqlQuery {
    let mut b = Builder::new(d, &req.info);
    let fields: Vec<&String> = req.object.keys().collect();
    let verb = match (replace, d) {
        (false, _) => "INSERT INTO ",
        (true, Dialect::Sqlite | Dialect::Mysql) => "REPLACE INTO ",
        (true, Dialect::Postgres) => "INSERT INTO ",
    };
    b.push(verb).ident(&req.table).push(" (");
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.ident(field);
    }
    b.push(") VALUES (");
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.arg(field, &req.object[field.as_str()]);
    }
    b.push(")");

    if replace && d == Dialect::Postgres {
        b.push(" ON CONFLICT (");
        for (i, key) in req.keys.iter().enumerate() {
            if i > 0 {
                b.push(", ");
            }
            b.ident(key);
        }
        // Declared columns the caller left out are cleared, as REPLACE does.
        let mut data: Vec<&String> = fields.iter().copied().filter(|f| !req.info.is_key(f)).collect();
        let omitted: Vec<&String> = req
            .info
            .columns
            .keys()
            .filter(|c| !req.info.is_key(c) && !req.object.contains_key(c.as_str()))
            .collect();
        data.extend(omitted.iter().copied());
        if data.is_empty() {
            b.push(") DO NOTHING");
        } else {
            b.push(") DO UPDATE SET ");
            for (i, field) in data.iter().enumerate() {
                if i > 0 {
                    b.push(", ");
                }
                if omitted.contains(field) {
                    b.ident(field).push(" = NULL");
                } else {
                    b.ident(field).push(" = EXCLUDED.").ident(field);
                }
            }
        }
    }
    b.finish()
}

/// `UPDATE ... SET` non-key fields, guarded by `options.expected`. `None`
/// when there is nothing to set.
pub fn update(d: Dialect, req: &PreparedRequest) -> Option<SqlQuery> {
    let data = req.data();
    if data.is_empty() {
        return None;
    }
    let mut b = Builder::new(d, &req.info);
    b.push("UPDATE ").ident(&req.table).push(" SET ");
    for (i, (field, value)) in data.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.ident(field).push(" = ").arg(field, value);
    }
    b.push(" WHERE ").equalities(&req.keys, &req.object);
    if let Some(expected) = &req.options.expected {
        let fields: Vec<String> = expected.keys().cloned().collect();
        if !fields.is_empty() {
            b.push(" AND ").equalities(&fields, expected);
        }
    }
    Some(b.finish())
}

/// `UPDATE ... SET c = COALESCE(c, 0) + ?` for every non-key field.
pub fn incr(d: Dialect, req: &PreparedRequest) -> Option<SqlQuery> {
    let data = req.data();
    if data.is_empty() {
        return None;
    }
    let mut b = Builder::new(d, &req.info);
    b.push("UPDATE ").ident(&req.table).push(" SET ");
    for (i, (field, value)) in data.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.ident(field).push(" = COALESCE(").ident(field).push(", 0) + ");
        b.raw_arg(SqlArg::for_column(value, None));
    }
    b.push(" WHERE ").equalities(&req.keys, &req.object);
    Some(b.finish())
}

pub fn delete(d: Dialect, req: &PreparedRequest) -> SqlQuery {
    let mut b = Builder::new(d, &req.info);
    b.push("DELETE FROM ").ident(&req.table).push(" WHERE ").equalities(&req.keys, &req.object);
    if let Some(expected) = &req.options.expected {
        let fields: Vec<String> = expected.keys().cloned().collect();
        if !fields.is_empty() {
            b.push(" AND ").equalities(&fields, expected);
        }
    }
    b.finish()
}

fn column_def(d: Dialect, name: &str, col: &ColumnSpec) -> String {
    let mut def = format!("{} {}", d.quote(name), d.column_type(col));
    if col.not_null || col.primary.is_some() {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        let literal = match default {
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Bool(b) if d != Dialect::Postgres => i64::from(*b).to_string(),
            other => other.to_string(),
        };
        def.push_str(&format!(" DEFAULT {literal}"));
    }
    def
}

/// `CREATE TABLE` followed by one `CREATE INDEX` per indexed column.
#[must_use]
pub fn create_table(d: Dialect, table: &str, spec: &TableSpec) -> Vec<String> {
    let mut defs: Vec<String> = spec.columns.iter().map(|(name, col)| column_def(d, name, col)).collect();
    let keys = spec.to_info().keys;
    let key_list: Vec<String> = keys.iter().map(|k| d.quote(k)).collect();
    if keys.iter().all(|k| spec.columns.contains_key(k)) {
        defs.push(format!("PRIMARY KEY ({})", key_list.join(", ")));
    }
    let mut out = vec![format!("CREATE TABLE IF NOT EXISTS {} ({})", d.quote(table), defs.join(", "))];
    out.extend(create_indexes(d, table, spec));
    out
}

fn create_indexes(d: Dialect, table: &str, spec: &TableSpec) -> Vec<String> {
    let exists = if d == Dialect::Mysql { "" } else { "IF NOT EXISTS " };
    spec.columns
        .iter()
        .filter(|(_, c)| c.index)
        .map(|(name, _)| {
            format!(
                "CREATE INDEX {exists}{} ON {} ({})",
                d.quote(&format!("{table}_{name}_idx")),
                d.quote(table),
                d.quote(name)
            )
        })
        .collect()
}

/// `ALTER TABLE ADD COLUMN` for every column in `spec`.
#[must_use]
pub fn add_columns(d: Dialect, table: &str, spec: &TableSpec) -> Vec<String> {
    let mut out: Vec<String> = spec
        .columns
        .iter()
        .map(|(name, col)| {
            let col = ColumnSpec { primary: None, ..col.clone() };
            format!("ALTER TABLE {} ADD COLUMN {}", d.quote(table), column_def(d, name, &col))
        })
        .collect();
    out.extend(create_indexes(d, table, spec));
    out
}

#[must_use]
pub fn drop_table(d: Dialect, table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", d.quote(table))
}

/// Catalog query listing `(table_name, column_name, data_type, key_position)`.
/// SQLite has no catalog view; its columns come from `PRAGMA table_info`.
#[must_use]
pub fn catalog(d: Dialect) -> &'static str {
    match d {
        Dialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        Dialect::Mysql => {
            "SELECT CAST(c.TABLE_NAME AS CHAR) AS table_name, CAST(c.COLUMN_NAME AS CHAR) AS column_name, \
             CAST(c.DATA_TYPE AS CHAR) AS data_type, CAST(k.ORDINAL_POSITION AS SIGNED) AS key_position \
             FROM information_schema.COLUMNS c \
             LEFT JOIN information_schema.KEY_COLUMN_USAGE k ON k.TABLE_SCHEMA = c.TABLE_SCHEMA \
             AND k.TABLE_NAME = c.TABLE_NAME AND k.COLUMN_NAME = c.COLUMN_NAME AND k.CONSTRAINT_NAME = 'PRIMARY' \
             WHERE c.TABLE_SCHEMA = DATABASE()"
        }
        Dialect::Postgres => {
            "SELECT CAST(c.table_name AS TEXT) AS table_name, CAST(c.column_name AS TEXT) AS column_name, \
             CAST(c.data_type AS TEXT) AS data_type, CAST(k.ordinal_position AS BIGINT) AS key_position \
             FROM information_schema.columns c \
             LEFT JOIN information_schema.table_constraints t ON t.table_schema = c.table_schema \
             AND t.table_name = c.table_name AND t.constraint_type = 'PRIMARY KEY' \
             LEFT JOIN information_schema.key_column_usage k ON k.constraint_name = t.constraint_name \
             AND k.table_schema = c.table_schema AND k.table_name = c.table_name AND k.column_name = c.column_name \
             WHERE c.table_schema = current_schema()"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{prepare, Capabilities, Op, Request};
    use serde_json::json;
    use std::sync::Arc;

    fn messages() -> Arc<TableInfo> {
        Arc::new(
            TableSpec::new()
                .primary("account_id", ColumnType::Text)
                .primary("mtime", ColumnType::Int)
                .column("status", ColumnType::Text)
                .to_info(),
        )
    }

    fn prepared(req: Request) -> PreparedRequest {
        prepare(&req, messages(), &Capabilities::NATIVE).unwrap()
    }

    #[test]
    fn test_select_where_order_limit() {
        let req = Request::new(Op::Select, "messages", json!({"account_id": "a1", "mtime": 10}))
            .with_op("mtime", FieldOp::Gt)
            .count(5);
        let q = select(Dialect::Sqlite, &prepared(req), 10).unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM \"messages\" WHERE \"account_id\" = ? AND \"mtime\" > ? \
             ORDER BY \"account_id\", \"mtime\" LIMIT 5 OFFSET 10"
        );
        assert_eq!(q.args, vec![SqlArg::Text("a1".into()), SqlArg::Int(10)]);
    }

    #[test]
    fn test_postgres_placeholders_and_sort() {
        let req = Request::new(Op::Select, "messages", json!({"status": ["new", "old"]})).sort("status", true);
        let q = select(Dialect::Postgres, &prepared(req), 0).unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM \"messages\" WHERE \"status\" IN ($1, $2) \
             ORDER BY \"status\" DESC, \"account_id\" DESC, \"mtime\" DESC"
        );
    }

    #[test]
    fn test_text_key_coerces_numbers() {
        let req = Request::new(Op::Get, "messages", json!({"account_id": 7, "mtime": "12"}));
        let q = get(Dialect::Mysql, &prepared(req));
        assert_eq!(q.sql, "SELECT * FROM `messages` WHERE `account_id` = ? AND `mtime` = ? LIMIT 1");
        assert_eq!(q.args, vec![SqlArg::Text("7".into()), SqlArg::Int(12)]);
    }

    #[test]
    fn test_update_guards_with_expected() {
        let req = Request::new(Op::Update, "messages", json!({"account_id": "a", "mtime": 1, "status": "done"}))
            .expected(json!({"status": "new"}));
        let q = update(Dialect::Sqlite, &prepared(req)).unwrap();
        assert_eq!(
            q.sql,
            "UPDATE \"messages\" SET \"status\" = ? WHERE \"account_id\" = ? AND \"mtime\" = ? AND \"status\" = ?"
        );
        assert_eq!(q.args.len(), 4);

        let keys_only = Request::new(Op::Update, "messages", json!({"account_id": "a", "mtime": 1}));
        assert!(update(Dialect::Sqlite, &prepared(keys_only)).is_none());
    }

    #[test]
    fn test_postgres_put_is_upsert() {
        let req = Request::new(Op::Put, "messages", json!({"account_id": "a", "mtime": 1, "status": "x"}));
        let q = insert(Dialect::Postgres, &prepared(req), true);
        assert!(q.sql.starts_with("INSERT INTO \"messages\""));
        assert!(q.sql.ends_with("ON CONFLICT (\"account_id\", \"mtime\") DO UPDATE SET \"status\" = EXCLUDED.\"status\""));
    }

    #[test]
    fn test_postgres_put_clears_omitted_columns() {
        let req = Request::new(Op::Put, "messages", json!({"account_id": "a", "mtime": 1}));
        let q = insert(Dialect::Postgres, &prepared(req), true);
        assert_eq!(
            q.sql,
            "INSERT INTO \"messages\" (\"account_id\", \"mtime\") VALUES ($1, $2) \
             ON CONFLICT (\"account_id\", \"mtime\") DO UPDATE SET \"status\" = NULL"
        );
    }

    #[test]
    fn test_prefix_filters_are_literal_and_case_sensitive() {
        let req = Request::new(Op::Select, "messages", json!({"account_id": "a", "status": "A%_"}))
            .with_op("status", FieldOp::BeginsWith);
        let q = select(Dialect::Sqlite, &prepared(req.clone()), 0).unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM \"messages\" WHERE \"account_id\" = ? AND SUBSTR(CAST(\"status\" AS TEXT), 1, 3) = ? \
             ORDER BY \"account_id\", \"mtime\""
        );
        assert_eq!(q.args[1], SqlArg::Text("A%_".into()));

        let q = select(Dialect::Mysql, &prepared(req), 0).unwrap();
        assert!(q.sql.contains("CAST(SUBSTR(CAST(`status` AS CHAR), 1, 3) AS BINARY) = CAST(? AS BINARY)"));

        let exact = Request::new(Op::Select, "messages", json!({"account_id": "a", "status": "x_y"}))
            .with_op("status", FieldOp::Like);
        let q = select(Dialect::Postgres, &prepared(exact), 0).unwrap();
        assert!(q.sql.contains("CAST(\"status\" AS TEXT) = $2"));
    }

    #[test]
    fn test_list_composite_keys() {
        let req = Request::new(Op::List, "messages", json!({"$list": [
            {"account_id": "a", "mtime": 1},
            {"account_id": "b", "mtime": 2}
        ]}));
        let q = list(Dialect::Sqlite, &prepared(req));
        assert!(q.sql.ends_with("WHERE (\"account_id\" = ? AND \"mtime\" = ?) OR (\"account_id\" = ? AND \"mtime\" = ?)"));
    }

    #[test]
    fn test_create_table_with_index() {
        let spec = TableSpec::new()
            .primary("id", ColumnType::Text)
            .indexed("email", ColumnType::Text)
            .column("n", ColumnType::Counter);
        let stmts = create_table(Dialect::Mysql, "users", &spec);
        assert_eq!(
            stmts[0],
            "CREATE TABLE IF NOT EXISTS `users` (`email` VARCHAR(255), `id` VARCHAR(255) NOT NULL, `n` BIGINT, PRIMARY KEY (`id`))"
        );
        assert_eq!(stmts[1], "CREATE INDEX `users_email_idx` ON `users` (`email`)");
    }

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(Dialect::from_url("sqlite::memory:"), Some(Dialect::Sqlite));
        assert_eq!(Dialect::from_url("postgresql://u@h/db"), Some(Dialect::Postgres));
        assert_eq!(Dialect::from_url("redis://h"), None);
    }
}
