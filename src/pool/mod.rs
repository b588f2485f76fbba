// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! A configured backend: engine (adapter + clients), table metadata and
//! runtime counters.
//!
//! [`Pool::query`] is the path every request takes once the registry has
//! picked a pool: resolve table metadata, [`prepare`], optionally check
//! existence, execute, then keep the schema cache in step with schema ops.

mod backend;
pub mod clients;

pub use self::backend::{pool_options, Engine, Managed};
pub use self::clients::{ClientPool, CoreStats, Manager, PoolOptions, PooledClient};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{DbError, Result};
use crate::metrics::{self, LatencyTimer};
use crate::request::{prepare, Op, PreparedRequest, QueryResult, Request};
use crate::schema::{canonical_table, SchemaCache, TableInfo, TableSpec};

/// Snapshot returned by [`Pool::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub kind: String,
    pub live: usize,
    pub idle: usize,
    pub waiting: usize,
    pub requests: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

pub struct Pool {
    name: String,
    config: RwLock<PoolConfig>,
    engine: RwLock<Arc<dyn Engine>>,
    schema: SchemaCache,
    declared: RwLock<HashMap<String, TableSpec>>,
    requests: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Pool {
    pub fn new(config: PoolConfig, engine: Arc<dyn Engine>) -> Self {
        Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            engine: RwLock::new(engine),
            schema: SchemaCache::new(),
            declared: RwLock::new(HashMap::new()),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.engine().kind()
    }

    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn engine(&self) -> Arc<dyn Engine> {
        self.engine.read().clone()
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaCache {
        &self.schema
    }

    /// Declare a table's columns and keys for this pool.
    pub fn describe_table(&self, table: &str, spec: TableSpec) {
        let table = canonical_table(table);
        let info = match self.schema.get(&table) {
            Some(existing) => existing.merged_with(&spec),
            None => spec.to_info(),
        };
        self.schema.insert(&table, info);
        self.declared.write().insert(table, spec);
    }

    /// Metadata used to prepare requests for `table`.
    #[must_use]
    pub fn table_info(&self, table: &str) -> Arc<TableInfo> {
        if let Some(info) = self.schema.get(table) {
            return info;
        }
        match self.declared.read().get(&canonical_table(table)) {
            Some(spec) => Arc::new(spec.to_info()),
            None => Arc::new(TableInfo::unknown()),
        }
    }

    /// Refresh table metadata from the backend, overlaying declared specs.
    pub async fn cache_columns(&self) -> Result<()> {
        let started = Instant::now();
        let mut tables = self.engine().cache_columns().await?;
        let declared = self.declared.read().clone();
        for (name, spec) in &declared {
            let merged = match tables.get(name) {
                Some(found) => found.merged_with(spec),
                None => spec.to_info(),
            };
            tables.insert(name.clone(), merged);
        }
        debug!(pool = %self.name, tables = tables.len(), "cached columns");
        self.schema.replace(tables);
        metrics::record_startup_phase("cache_columns", started.elapsed());
        Ok(())
    }

    /// Create declared tables that do not exist and add missing columns.
    pub async fn init_tables(&self) -> Result<()> {
        self.cache_columns().await?;
        let declared = self.declared.read().clone();
        let mut native = self.engine().cache_columns().await?;
        let mut changed = false;
        for (table, spec) in declared {
            match native.remove(&table) {
                None => {
                    info!(pool = %self.name, table = %table, "creating table");
                    self.create_table(&table, &spec).await?;
                    changed = true;
                }
                Some(found) if !found.missing_columns(&spec).is_empty() => {
                    info!(pool = %self.name, table = %table, "adding columns");
                    self.upgrade_table(&table, &spec).await?;
                    changed = true;
                }
                Some(_) => {}
            }
        }
        if changed {
            self.cache_columns().await?;
        }
        Ok(())
    }

    pub async fn create_table(&self, table: &str, spec: &TableSpec) -> Result<QueryResult> {
        let object = serde_json::to_value(spec).map_err(|e| DbError::invalid(e.to_string()))?;
        self.query(&Request::new(Op::Create, table, object)).await
    }

    /// Add the columns of `spec` the backend does not have yet.
    pub async fn upgrade_table(&self, table: &str, spec: &TableSpec) -> Result<QueryResult> {
        let existing = self.engine().cache_columns().await?.remove(&canonical_table(table));
        let Some(existing) = existing else {
            return self.create_table(table, spec).await;
        };
        let missing: TableSpec = TableSpec {
            columns: existing
                .missing_columns(spec)
                .into_iter()
                .map(|(name, col)| (name.clone(), col.clone()))
                .collect(),
        };
        if missing.columns.is_empty() {
            return Ok(QueryResult::affected(0));
        }
        let object = serde_json::to_value(&missing).map_err(|e| DbError::invalid(e.to_string()))?;
        self.query(&Request::new(Op::Upgrade, table, object)).await
    }

    pub async fn drop_table(&self, table: &str) -> Result<QueryResult> {
        self.query(&Request::new(Op::Drop, table, Value::Null)).await
    }

    /// Run one request against this pool.
    #[tracing::instrument(skip(self, req), fields(pool = %self.name, op = %req.op, table = %req.table))]
    pub async fn query(&self, req: &Request) -> Result<QueryResult> {
        let _timer = LatencyTimer::new(&self.name, req.op.as_str());
        self.requests.fetch_add(1, Ordering::Relaxed);

        let result = self.run(req).await;
        match &result {
            Ok(res) => {
                metrics::record_request(&self.name, req.op.as_str(), "success");
                if req.op.is_read() {
                    metrics::record_rows(&self.name, req.op.as_str(), res.rows.len());
                }
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_request(&self.name, req.op.as_str(), "error");
                metrics::record_error(&self.name, req.op.as_str(), e.class());
                if e.is_transient() {
                    warn!(error = %e, "request failed");
                } else {
                    debug!(error = %e, "request failed");
                }
            }
        }
        result
    }

    async fn run(&self, req: &Request) -> Result<QueryResult> {
        let engine = self.engine();
        let info = match req.op {
            Op::Create | Op::Upgrade => Arc::new(table_spec(req)?.to_info()),
            _ => self.table_info(&req.table),
        };
        let prepared = prepare(req, info, &engine.capabilities())?;

        if prepared.options.must_exist && matches!(req.op, Op::Update | Op::Del) {
            self.require_existing(&engine, &prepared).await?;
        }

        let result = engine.execute(&prepared).await?;
        self.after_schema_op(req, &prepared)?;
        Ok(result)
    }

    async fn require_existing(&self, engine: &Arc<dyn Engine>, req: &PreparedRequest) -> Result<()> {
        let mut get = req.clone();
        get.op = Op::Get;
        get.object = req.key_row();
        let found = engine.execute(&get).await?;
        if found.rows.is_empty() {
            return Err(DbError::InvalidId { table: req.table.clone() });
        }
        Ok(())
    }

    fn after_schema_op(&self, req: &Request, prepared: &PreparedRequest) -> Result<()> {
        match req.op {
            Op::Create => {
                let spec = table_spec(req)?;
                self.describe_table(&prepared.table, spec);
            }
            Op::Upgrade => {
                let spec = table_spec(req)?;
                let merged = self.table_info(&prepared.table).merged_with(&spec);
                self.schema.insert(&prepared.table, merged);
            }
            Op::Drop => {
                self.schema.remove(&prepared.table);
            }
            _ => {}
        }
        Ok(())
    }

    /// Open `min` clients and load table metadata.
    #[tracing::instrument(skip(self), fields(pool = %self.name))]
    pub async fn start(&self) -> Result<()> {
        let started = Instant::now();
        let min = self.config.read().min;
        if min > 0 {
            let opened = self.engine().prefill(min).await?;
            debug!(opened, "prefilled clients");
        }
        metrics::record_startup_phase("prefill", started.elapsed());
        if let Err(e) = self.cache_columns().await {
            warn!(error = %e, "cache_columns failed at startup");
        }
        Ok(())
    }

    /// Merge a new configuration into the live pool. Sizing changes apply in
    /// place; a new kind/url/options swaps in `rebuilt` and retires the old
    /// engine once its in-flight clients come back.
    pub fn configure(&self, new: PoolConfig, rebuilt: Option<Arc<dyn Engine>>) {
        let old = self.config.read().clone();
        match rebuilt {
            Some(engine) if old.needs_reconnect(&new) => {
                let previous = std::mem::replace(&mut *self.engine.write(), engine);
                previous.retire();
                info!(pool = %self.name, kind = %new.kind, "pool reconnected with new settings");
            }
            _ => {
                self.engine().resize(pool_options(&new));
                debug!(pool = %self.name, max = new.max, "pool resized");
            }
        }
        *self.config.write() = new;
    }

    /// Drain every client.
    pub fn shutdown(&self) {
        self.engine().shutdown();
        info!(pool = %self.name, "pool shut down");
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let core = self.engine().stats();
        PoolStats {
            name: self.name.clone(),
            kind: self.kind().to_string(),
            live: core.live,
            idle: core.idle,
            waiting: core.waiting,
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Count one cached read served for this pool.
    pub fn record_cache(&self, hit: bool) {
        let counter = if hit { &self.cache_hits } else { &self.cache_misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("name", &self.name).field("kind", &self.kind()).finish()
    }
}

fn table_spec(req: &Request) -> Result<TableSpec> {
    serde_json::from_value(Value::Object(req.object.clone()))
        .map_err(|e| DbError::invalid(format!("invalid table definition for '{}': {e}", req.table)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::schema::ColumnType;
    use serde_json::json;

    fn memory_pool(max: usize) -> Pool {
        let cfg = PoolConfig { max, ..PoolConfig::new("mem", "memory") };
        let engine = AdapterRegistry::builtin().build(&cfg).unwrap();
        Pool::new(cfg, engine)
    }

    #[tokio::test]
    async fn test_query_round_trip_and_stats() {
        let pool = memory_pool(0);
        pool.query(&Request::new(Op::Add, "users", json!({"id": "1", "name": "a"}))).await.unwrap();
        let res = pool.query(&Request::new(Op::Get, "users", json!({"id": "1"}))).await.unwrap();
        assert_eq!(Value::Object(res.rows[0].clone()), json!({"id": "1", "name": "a"}));

        let stats = pool.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.kind, "memory");
    }

    #[tokio::test]
    async fn test_must_exist_yields_invalid_id() {
        let pool = memory_pool(2);
        let err = pool
            .query(&Request::new(Op::Update, "users", json!({"id": "nope", "name": "x"})).must_exist())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidId { .. }));
        assert_eq!(pool.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_declared_keys_drive_prepare() {
        let pool = memory_pool(2);
        pool.describe_table(
            "Messages",
            TableSpec::new().primary("account_id", ColumnType::Text).primary("mtime", ColumnType::Int),
        );
        assert_eq!(pool.table_info("messages").keys, vec!["account_id", "mtime"]);
        let err = pool
            .query(&Request::new(Op::Get, "messages", json!({"account_id": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_configure_resizes_in_place() {
        let pool = memory_pool(2);
        let engine = pool.engine();
        pool.configure(PoolConfig { max: 5, ..pool.config() }, None);
        assert!(Arc::ptr_eq(&engine, &pool.engine()));
        assert_eq!(pool.config().max, 5);
    }
}
