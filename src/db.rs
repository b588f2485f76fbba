// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-level service.
//!
//! [`Db`] routes each request to its pool through the [`Registry`] and keeps
//! the [`CacheLayer`] consistent with writes:
//!
//! - `get` is answered from the cache when the table is cached
//! - `add` points declared secondary keys at the new record
//! - `put`, `update`, `incr` and `del` invalidate the record and its
//!   secondary keys before returning

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::CacheLayer;
use crate::config::RegistryConfig;
use crate::emulation::project;
use crate::error::Result;
use crate::pool::{Pool, PoolStats};
use crate::registry::Registry;
use crate::request::{Op, QueryOptions, QueryResult, Request};
use crate::schema::{canonical_table, TableSpec};

pub struct Db {
    registry: Arc<Registry>,
    cache: Arc<CacheLayer>,
}

impl Db {
    /// Build the registry and connect the cache layer. A shared cache that
    /// cannot be reached leaves the cache process-local.
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new(config)?);
        let cache = Arc::new(CacheLayer::connect(config.cache.clone()).await);
        Ok(Self { registry, cache })
    }

    #[must_use]
    pub fn with_parts(registry: Arc<Registry>, cache: Arc<CacheLayer>) -> Self {
        Self { registry, cache }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub async fn start(&self) -> Result<()> {
        self.registry.start().await
    }

    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.cache.local_tier().clear();
    }

    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        self.registry.stats()
    }

    /// Follow configuration updates for pools and cache settings.
    pub fn watch_config(&self, rx: watch::Receiver<RegistryConfig>) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        self.registry.watch_config(rx, move |config| cache.configure(config.cache.clone()))
    }

    /// Run one request, going through the cache for reads of cached tables.
    #[tracing::instrument(skip(self, req), fields(op = %req.op, table = %req.table))]
    pub async fn query(&self, req: Request) -> Result<QueryResult> {
        let pool = self.registry.get_pool(req.options.pool.as_deref());
        if req.op == Op::Get && !req.options.no_cache {
            return self.cached_get(&pool, req).await;
        }
        let result = pool.query(&req).await?;
        if req.op.is_write() && !req.options.no_cache {
            self.after_write(&pool, &req).await;
        }
        Ok(result)
    }

    /// `get` through both cache tiers. `options.cache_key_name` looks the
    /// record up by a declared secondary key instead of the primary key.
    pub async fn get_cached(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::Get, table, object).with_options(options)).await
    }

    async fn cached_get(&self, pool: &Pool, req: Request) -> Result<QueryResult> {
        let table = canonical_table(&req.table);
        let info = pool.table_info(&table);
        let Some(plan) = self.cache.plan(pool.name(), &table, &info.keys, &req.object, &req.options) else {
            return pool.query(&req).await;
        };
        let select = req.options.select.clone();

        if let Some((row, tier)) = self.cache.read(&plan).await {
            pool.record_cache(true);
            let mut result = QueryResult::rows(vec![project(row, select.as_deref())]);
            result.info.cached = tier;
            return Ok(result);
        }

        pool.record_cache(false);
        // Fetch the whole record so later projections can be served from it.
        let mut fetch = req;
        fetch.options.select = None;
        if plan.primary.is_none() {
            fetch.op = Op::Select;
            fetch.options.count = Some(1);
            fetch.options.start = None;
        }
        let mut result = pool.query(&fetch).await?;
        result.rows.truncate(1);
        result.info.next_token = None;
        if let Some(row) = result.rows.first() {
            self.cache.store(&plan, row).await;
        }
        result.rows = result.rows.into_iter().map(|r| project(r, select.as_deref())).collect();
        Ok(result)
    }

    async fn after_write(&self, pool: &Pool, req: &Request) {
        let table = canonical_table(&req.table);
        let scope = req.options.cache_name.as_deref().unwrap_or(pool.name());
        let keys = pool.table_info(&table).keys.clone();
        match req.op {
            Op::Add => self.cache.store_secondary(scope, &table, &keys, &req.object).await,
            Op::Put | Op::Update | Op::Incr | Op::Del => {
                self.cache.invalidate(scope, &table, &keys, &req.object).await;
            }
            _ => debug!(op = %req.op, "no cache maintenance for operation"),
        }
    }

    pub async fn get(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::Get, table, object).with_options(options)).await
    }

    pub async fn select(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::Select, table, object).with_options(options)).await
    }

    /// Multi-key get; see [`crate::request::LIST_FIELD`] for the input shape.
    pub async fn list(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::List, table, object).with_options(options)).await
    }

    pub async fn add(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::Add, table, object).with_options(options)).await
    }

    pub async fn put(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::Put, table, object).with_options(options)).await
    }

    pub async fn update(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::Update, table, object).with_options(options)).await
    }

    pub async fn incr(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::Incr, table, object).with_options(options)).await
    }

    pub async fn del(&self, table: &str, object: Value, options: QueryOptions) -> Result<QueryResult> {
        self.query(Request::new(Op::Del, table, object).with_options(options)).await
    }

    pub async fn create(&self, table: &str, spec: &TableSpec, pool: Option<&str>) -> Result<QueryResult> {
        self.registry.get_pool(pool).create_table(table, spec).await
    }

    /// Add the columns of `spec` missing from the table, creating it if needed.
    pub async fn upgrade(&self, table: &str, spec: &TableSpec, pool: Option<&str>) -> Result<QueryResult> {
        self.registry.get_pool(pool).upgrade_table(table, spec).await
    }

    pub async fn drop(&self, table: &str, pool: Option<&str>) -> Result<QueryResult> {
        self.registry.get_pool(pool).drop_table(table).await
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("registry", &self.registry).finish_non_exhaustive()
    }
}
