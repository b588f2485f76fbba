// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL adapter over the sqlx `Any` driver (SQLite, MySQL, PostgreSQL).
//!
//! Filtering, sorting and paging are all native. The continuation token is
//! the row offset of the next page; results are always ordered by the
//! requested sort column and then the primary key, so offsets are stable.
//!
//! # sqlx `Any` quirks
//!
//! - Drivers must be installed at runtime before the first connect.
//! - There is no JSON type mapping, so JSON columns are stored as text and
//!   decoded with the declared column type.
//! - SQLite `:memory:` databases are per connection: give such pools `max = 1`.

mod builder;

pub use builder::{Dialect, SqlArg, SqlQuery};

use std::collections::{BTreeMap, HashMap};
use std::sync::Once;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{Any, AnyArguments, AnyRow};
use sqlx::AnyConnection;
use sqlx::query::Query;
use sqlx::{Column, Connection, Row as _};
use tracing::debug;

use super::{start_offset, Adapter};
use crate::config::PoolConfig;
use crate::error::{DbError, Result};
use crate::request::{Capabilities, Op, PreparedRequest, QueryResult, Row};
use crate::schema::{canonical_table, ColumnSpec, ColumnType, TableInfo, TableSpec};

static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlAdapter {
    kind: &'static str,
    dialect: Dialect,
    url: String,
}

impl SqlAdapter {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let dialect = Dialect::from_url(&url)
            .ok_or_else(|| DbError::invalid(format!("unsupported sql url '{url}'")))?;
        let kind = match dialect {
            Dialect::Sqlite => "sqlite",
            Dialect::Mysql => "mysql",
            Dialect::Postgres => "postgres",
        };
        install_drivers();
        Ok(Self { kind, dialect, url })
    }

    pub fn from_config(cfg: &PoolConfig) -> Result<Self> {
        if cfg.url.is_empty() && cfg.kind.eq_ignore_ascii_case("sqlite") {
            return Self::new("sqlite::memory:");
        }
        Self::new(cfg.url.clone())
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn fetch(&self, client: &mut AnyConnection, req: &PreparedRequest, q: &SqlQuery) -> Result<Vec<Row>> {
        debug!(sql = %q.sql, "sql fetch");
        let rows = bind(q).fetch_all(&mut *client).await.map_err(|e| self.convert_error(req, e))?;
        Ok(rows.iter().map(|r| decode_row(r, &req.info)).collect())
    }

    async fn execute(&self, client: &mut AnyConnection, req: &PreparedRequest, q: &SqlQuery) -> Result<u64> {
        debug!(sql = %q.sql, "sql execute");
        let done = bind(q).execute(&mut *client).await.map_err(|e| self.convert_error(req, e))?;
        Ok(done.rows_affected())
    }

    async fn statements(&self, client: &mut AnyConnection, req: &PreparedRequest, sql: &[String]) -> Result<u64> {
        for stmt in sql {
            debug!(sql = %stmt, "sql schema");
            sqlx::query(stmt)
                .execute(&mut *client)
                .await
                .map_err(|e| self.convert_error(req, e))?;
        }
        Ok(0)
    }

    /// Increment existing counters, inserting the row when it is missing.
    async fn incr(&self, client: &mut AnyConnection, req: &PreparedRequest) -> Result<u64> {
        let Some(q) = builder::incr(self.dialect, req) else {
            return Ok(0);
        };
        let n = self.execute(client, req, &q).await?;
        if n > 0 {
            return Ok(n);
        }
        match self.execute(client, req, &builder::insert(self.dialect, req, false)).await {
            Ok(n) => Ok(n),
            // Lost the race with a concurrent insert of the same key.
            Err(DbError::AlreadyExists { .. }) => self.execute(client, req, &q).await,
            Err(e) => Err(e),
        }
    }

    fn spec_of(req: &PreparedRequest) -> Result<TableSpec> {
        serde_json::from_value(Value::Object(req.object.clone())).map_err(|e| DbError::invalid(e.to_string()))
    }

    async fn sqlite_columns(&self, client: &mut AnyConnection) -> std::result::Result<HashMap<String, TableInfo>, sqlx::Error> {
        let names: Vec<String> = sqlx::query(builder::catalog(Dialect::Sqlite))
            .fetch_all(&mut *client)
            .await?
            .iter()
            .filter_map(|r| r.try_get::<String, _>(0).ok())
            .collect();

        let mut tables = HashMap::new();
        for name in names {
            let pragma = format!("PRAGMA table_info({})", self.dialect.quote(&name));
            let mut columns = BTreeMap::new();
            let mut keys: Vec<(i64, String)> = Vec::new();
            for row in sqlx::query(&pragma).fetch_all(&mut *client).await? {
                let column: String = row.try_get("name")?;
                let kind: String = row.try_get::<Option<String>, _>("type")?.unwrap_or_default();
                let pk: i64 = row.try_get("pk")?;
                let not_null: i64 = row.try_get("notnull")?;
                if pk > 0 {
                    keys.push((pk, column.clone()));
                }
                columns.insert(
                    column,
                    ColumnSpec {
                        kind: ColumnType::from_native(&kind),
                        primary: u32::try_from(pk).ok().filter(|p| *p > 0),
                        not_null: not_null != 0,
                        ..Default::default()
                    },
                );
            }

            let mut indexes = BTreeMap::new();
            let list = format!("PRAGMA index_list({})", self.dialect.quote(&name));
            for index in sqlx::query(&list).fetch_all(&mut *client).await? {
                let index_name: String = index.try_get("name")?;
                let info = format!("PRAGMA index_info({})", self.dialect.quote(&index_name));
                let cols: Vec<String> = sqlx::query(&info)
                    .fetch_all(&mut *client)
                    .await?
                    .iter()
                    .filter_map(|r| r.try_get::<String, _>("name").ok())
                    .collect();
                indexes.insert(index_name, cols);
            }

            keys.sort();
            tables.insert(
                canonical_table(&name),
                TableInfo {
                    columns,
                    keys: keys.into_iter().map(|(_, k)| k).collect(),
                    indexes,
                },
            );
        }
        Ok(tables)
    }

    async fn catalog_columns(&self, client: &mut AnyConnection) -> std::result::Result<HashMap<String, TableInfo>, sqlx::Error> {
        let rows = sqlx::query(builder::catalog(self.dialect)).fetch_all(&mut *client).await?;
        let mut tables: HashMap<String, (TableInfo, Vec<(i64, String)>)> = HashMap::new();
        for row in rows {
            let table: String = row.try_get("table_name")?;
            let column: String = row.try_get("column_name")?;
            let kind: String = row.try_get("data_type")?;
            let position: Option<i64> = row.try_get("key_position")?;
            let (info, keys) = tables.entry(canonical_table(&table)).or_default();
            if let Some(p) = position {
                keys.push((p, column.clone()));
            }
            info.columns.insert(
                column,
                ColumnSpec {
                    kind: ColumnType::from_native(&kind),
                    primary: position.and_then(|p| u32::try_from(p).ok()),
                    ..Default::default()
                },
            );
        }
        Ok(tables
            .into_iter()
            .map(|(name, (mut info, mut keys))| {
                keys.sort();
                info.keys = keys.into_iter().map(|(_, k)| k).collect();
                (name, info)
            })
            .collect())
    }
}

fn bind(q: &SqlQuery) -> Query<'_, Any, AnyArguments<'_>> {
    let mut query = sqlx::query(&q.sql);
    for arg in &q.args {
        query = match arg {
            SqlArg::Null => query.bind(None::<String>),
            SqlArg::Bool(b) => query.bind(*b),
            SqlArg::Int(n) => query.bind(*n),
            SqlArg::Real(f) => query.bind(*f),
            SqlArg::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

/// Decode one cell without knowing its SQL type up front.
fn decode_cell(row: &AnyRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return Value::String(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return Value::String(String::from_utf8_lossy(&v).into_owned());
    }
    Value::Null
}

fn decode_row(row: &AnyRow, info: &TableInfo) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let value = match (decode_cell(row, idx), info.column_type(name)) {
            (Value::String(s), Some(kind)) => kind.decode_text(&s),
            (Value::Number(n), Some(ColumnType::Bool)) => Value::Bool(n.as_i64().is_some_and(|i| i != 0)),
            (value, _) => value,
        };
        out.insert(name.to_string(), value);
    }
    out
}

/// SQLSTATE / native codes worth retrying.
fn is_transient_code(code: &str) -> bool {
    matches!(
        code,
        // serialization failure / deadlock, lock not available
        "40001" | "40P01" | "55P03"
        // busy, locked (sqlite)
        | "5" | "6"
    )
}

#[async_trait]
impl Adapter for SqlAdapter {
    type Client = AnyConnection;
    type NativeError = sqlx::Error;

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NATIVE
    }

    async fn open(&self) -> Result<AnyConnection> {
        let mut conn = AnyConnection::connect(&self.url)
            .await
            .map_err(|e| DbError::connect(self.kind, e))?;
        if self.dialect == Dialect::Sqlite && !self.url.contains(":memory:") {
            for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA synchronous = NORMAL", "PRAGMA busy_timeout = 5000"] {
                sqlx::query(pragma)
                    .execute(&mut conn)
                    .await
                    .map_err(|e| DbError::connect(self.kind, e))?;
            }
        }
        Ok(conn)
    }

    async fn query(&self, client: &mut AnyConnection, req: &PreparedRequest) -> Result<QueryResult> {
        let d = self.dialect;
        match req.op {
            Op::Get => Ok(QueryResult::rows(self.fetch(client, req, &builder::get(d, req)).await?)),
            Op::List => Ok(QueryResult::rows(self.fetch(client, req, &builder::list(d, req)).await?)),
            Op::Select => {
                let q = builder::select(d, req, start_offset(req)?)?;
                Ok(QueryResult::rows(req.finish(self.fetch(client, req, &q).await?)))
            }
            Op::Add => {
                let n = self.execute(client, req, &builder::insert(d, req, false)).await?;
                Ok(QueryResult::affected(n))
            }
            Op::Put => {
                // MySQL REPLACE counts the delete and the insert.
                let n = self.execute(client, req, &builder::insert(d, req, true)).await?;
                Ok(QueryResult::affected(n.min(1)))
            }
            Op::Update => match builder::update(d, req) {
                Some(q) => Ok(QueryResult::affected(self.execute(client, req, &q).await?)),
                None => Ok(QueryResult::affected(0)),
            },
            Op::Incr => Ok(QueryResult::affected(self.incr(client, req).await?)),
            Op::Del => Ok(QueryResult::affected(self.execute(client, req, &builder::delete(d, req)).await?)),
            Op::Create => {
                let spec = Self::spec_of(req)?;
                self.statements(client, req, &builder::create_table(d, &req.table, &spec)).await?;
                Ok(QueryResult::affected(0))
            }
            Op::Upgrade => {
                let spec = Self::spec_of(req)?;
                self.statements(client, req, &builder::add_columns(d, &req.table, &spec)).await?;
                Ok(QueryResult::affected(0))
            }
            Op::Drop => {
                self.statements(client, req, &[builder::drop_table(d, &req.table)]).await?;
                Ok(QueryResult::affected(0))
            }
        }
    }

    async fn cache_columns(&self, client: &mut AnyConnection) -> Result<HashMap<String, TableInfo>> {
        let tables = match self.dialect {
            Dialect::Sqlite => self.sqlite_columns(client).await,
            Dialect::Mysql | Dialect::Postgres => self.catalog_columns(client).await,
        };
        tables.map_err(|e| DbError::backend(self.kind, e))
    }

    fn convert_error(&self, req: &PreparedRequest, err: sqlx::Error) -> DbError {
        match err {
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() && matches!(req.op, Op::Add | Op::Incr) {
                    return DbError::AlreadyExists { table: req.table.clone() };
                }
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                let transient = is_transient_code(&code);
                DbError::backend_code(self.kind, code, db.message(), transient)
            }
            e @ (sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_)) => {
                DbError::backend_code(self.kind, "io", e, true)
            }
            e @ sqlx::Error::Protocol(_) => DbError::backend_code(self.kind, "protocol", e, true),
            e => DbError::backend(self.kind, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{prepare, Request};
    use serde_json::json;
    use std::sync::Arc;

    fn users() -> TableSpec {
        TableSpec::new()
            .primary("id", ColumnType::Text)
            .column("name", ColumnType::Text)
            .column("age", ColumnType::Int)
            .column("tags", ColumnType::Json)
            .column("active", ColumnType::Bool)
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        adapter: SqlAdapter,
        conn: AnyConnection,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let adapter = SqlAdapter::new(url).unwrap();
        let mut conn = adapter.open().await.unwrap();
        let spec = users();
        let create = Request::new(Op::Create, "users", serde_json::to_value(&spec).unwrap());
        let p = prepare(&create, Arc::new(spec.to_info()), &adapter.capabilities()).unwrap();
        adapter.query(&mut conn, &p).await.unwrap();
        Fixture { _dir: dir, adapter, conn }
    }

    async fn run(f: &mut Fixture, req: Request) -> Result<QueryResult> {
        let p = prepare(&req, Arc::new(users().to_info()), &f.adapter.capabilities())?;
        f.adapter.query(&mut f.conn, &p).await
    }

    #[tokio::test]
    async fn test_add_get_round_trip_with_types() {
        let mut f = fixture().await;
        run(&mut f, Request::new(Op::Add, "users", json!({
            "id": "1", "name": "a", "age": 30, "tags": ["x", "y"], "active": true
        })))
        .await
        .unwrap();

        let got = run(&mut f, Request::new(Op::Get, "users", json!({"id": "1"}))).await.unwrap();
        assert_eq!(
            Value::Object(got.rows[0].clone()),
            json!({"id": "1", "name": "a", "age": 30, "tags": ["x", "y"], "active": true})
        );

        let dup = run(&mut f, Request::new(Op::Add, "users", json!({"id": "1", "name": "b"}))).await;
        assert!(matches!(dup, Err(DbError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_offset_pagination_and_native_filter() {
        let mut f = fixture().await;
        for i in 0..7 {
            run(&mut f, Request::new(Op::Add, "users", json!({"id": format!("u{i}"), "age": i}))).await.unwrap();
        }
        let p1 = run(&mut f, Request::new(Op::Select, "users", json!({"age": 1})).with_op("age", crate::request::FieldOp::Ge).count(3))
            .await
            .unwrap();
        assert_eq!(p1.rows.len(), 3);
        assert_eq!(p1.rows[0]["id"], json!("u1"));

        let p2 = run(
            &mut f,
            Request::new(Op::Select, "users", json!({"age": 1}))
                .with_op("age", crate::request::FieldOp::Ge)
                .count(3)
                .start(Some(json!(3))),
        )
        .await
        .unwrap();
        let ids: Vec<&str> = p2.rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["u4", "u5", "u6"]);
    }

    #[tokio::test]
    async fn test_update_expected_incr_and_del() {
        let mut f = fixture().await;
        run(&mut f, Request::new(Op::Add, "users", json!({"id": "1", "name": "a", "age": 1}))).await.unwrap();

        let stale = Request::new(Op::Update, "users", json!({"id": "1", "name": "b"})).expected(json!({"name": "z"}));
        assert_eq!(run(&mut f, stale).await.unwrap().affected_rows(), 0);
        let fresh = Request::new(Op::Update, "users", json!({"id": "1", "name": "b"})).expected(json!({"name": "a"}));
        assert_eq!(run(&mut f, fresh).await.unwrap().affected_rows(), 1);

        run(&mut f, Request::new(Op::Incr, "users", json!({"id": "1", "age": 5}))).await.unwrap();
        run(&mut f, Request::new(Op::Incr, "users", json!({"id": "2", "age": 2}))).await.unwrap();
        let listed = run(&mut f, Request::new(Op::List, "users", json!({"id": ["1", "2", "3"]}))).await.unwrap();
        let mut ages: Vec<i64> = listed.rows.iter().map(|r| r["age"].as_i64().unwrap()).collect();
        ages.sort_unstable();
        assert_eq!(ages, vec![2, 6]);

        let del = run(&mut f, Request::new(Op::Del, "users", json!({"id": "1"}))).await.unwrap();
        assert_eq!(del.affected_rows(), 1);
    }

    #[tokio::test]
    async fn test_cache_columns_and_upgrade() {
        let mut f = fixture().await;
        let extra = TableSpec::new().column("email", ColumnType::Text);
        let upgrade = Request::new(Op::Upgrade, "users", serde_json::to_value(&extra).unwrap());
        let p = prepare(&upgrade, Arc::new(extra.to_info()), &f.adapter.capabilities()).unwrap();
        f.adapter.query(&mut f.conn, &p).await.unwrap();

        let tables = f.adapter.cache_columns(&mut f.conn).await.unwrap();
        let info = &tables["users"];
        assert_eq!(info.keys, vec!["id"]);
        assert_eq!(info.column_type("age"), Some(ColumnType::Int));
        assert!(info.columns.contains_key("email"));
    }
}
