// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier record cache.
//!
//! Records are cached under `prefix:k1:k2...` built from the table's primary
//! key; a declared secondary key set caches a pointer from its own key to
//! the primary one. Reads try the process-local tier first, then the shared
//! tier. Shared-tier calls go through a circuit breaker and any failure is
//! treated as a miss.
//!
//! ```text
//! users:42            -> {"id": 42, "email": "a@b.c", ...}
//! users:email:a@b.c   -> "users:42"
//! ```

mod local;
mod redis;

pub use local::LocalCache;
pub use redis::{RedisCache, SharedCache};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{CacheConfig, TableCacheConfig};
use crate::emulation::key_part;
use crate::request::{QueryOptions, Row};
use crate::resilience::{CircuitBreaker, CircuitConfig, CircuitError};

/// `info.cached` for a miss.
pub const MISS: u8 = 0;
/// `info.cached` for a local tier hit.
pub const LOCAL_HIT: u8 = 1;
/// `info.cached` for a shared tier hit.
pub const SHARED_HIT: u8 = 2;

/// Where one cached read looks, and for how long it stores.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePlan {
    pub table: String,
    /// Primary cache key, when the request names every primary key field.
    pub primary: Option<String>,
    /// Secondary key pointing at the primary one.
    pub secondary: Option<String>,
    /// Column values the secondary key was built from; a record reached
    /// through the pointer must still carry them.
    secondary_fields: Row,
    pub local_ttl: Option<Duration>,
    pub shared_ttl: Option<Duration>,
    prefix: String,
    keys: Vec<String>,
}

impl CachePlan {
    /// Primary cache key of a fetched record.
    #[must_use]
    pub fn primary_of(&self, row: &Row) -> Option<String> {
        cache_key(&self.prefix, &self.keys, row)
    }
}

/// `prefix:v1:v2...`, or `None` when a column is missing.
#[must_use]
pub fn cache_key(prefix: &str, columns: &[String], row: &Row) -> Option<String> {
    let mut key = prefix.to_string();
    for column in columns {
        match row.get(column) {
            None | Some(Value::Null) => return None,
            Some(v) => {
                key.push(':');
                key.push_str(&key_part(v));
            }
        }
    }
    Some(key)
}

pub struct CacheLayer {
    config: RwLock<CacheConfig>,
    local: LocalCache,
    shared: Option<Arc<dyn SharedCache>>,
    breaker: CircuitBreaker,
}

impl CacheLayer {
    /// Cache with the local tier only.
    #[must_use]
    pub fn local(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    #[must_use]
    pub fn with_shared(config: CacheConfig, shared: Arc<dyn SharedCache>) -> Self {
        Self::build(config, Some(shared))
    }

    /// Connect the shared tier named by `redis_url`. A tier that cannot be
    /// reached is left out rather than failing startup.
    pub async fn connect(config: CacheConfig) -> Self {
        let Some(url) = config.redis_url.clone() else {
            return Self::local(config);
        };
        match RedisCache::connect(&url).await {
            Ok(redis) => Self::with_shared(config, Arc::new(redis)),
            Err(e) => {
                warn!(error = %e, "shared cache unavailable, running with the local tier only");
                Self::local(config)
            }
        }
    }

    fn build(config: CacheConfig, shared: Option<Arc<dyn SharedCache>>) -> Self {
        let breaker = CircuitBreaker::new("cache_shared", CircuitConfig::cache(config.breaker_failures));
        Self { local: LocalCache::new(config.local_max_entries), config: RwLock::new(config), shared, breaker }
    }

    /// Apply a new configuration; the tiers keep their entries.
    pub fn configure(&self, config: CacheConfig) {
        *self.config.write() = config;
    }

    #[must_use]
    pub fn local_tier(&self) -> &LocalCache {
        &self.local
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Table settings, looked up as `pool.table` first, then `table`.
    fn table_config(&self, pool: &str, table: &str) -> Option<TableCacheConfig> {
        let config = self.config.read();
        if !config.enabled {
            return None;
        }
        config
            .tables
            .get(&format!("{pool}.{table}"))
            .or_else(|| config.tables.get(table))
            .filter(|t| t.is_cached())
            .cloned()
    }

    /// Cache plan for reading `object` of `table`, or `None` when the table
    /// is not cached or no key can be derived.
    #[must_use]
    pub fn plan(&self, pool: &str, table: &str, keys: &[String], object: &Row, options: &QueryOptions) -> Option<CachePlan> {
        let cfg = self.table_config(options.cache_name.as_deref().unwrap_or(pool), table)?;
        let prefix = cfg.prefix.clone().unwrap_or_else(|| table.to_string());
        let (mut local_ttl, mut shared_ttl) = (cfg.effective_local_ttl(), cfg.ttl);
        match options.cache_ttl {
            Some(ttl) if ttl < 0 => {
                local_ttl = Some(ttl.unsigned_abs());
                shared_ttl = None;
            }
            Some(ttl) if ttl > 0 => {
                shared_ttl = Some(ttl.unsigned_abs());
                local_ttl = local_ttl.map(|l| l.min(shared_ttl.unwrap_or(l).saturating_sub(1).max(1)));
            }
            _ => {}
        }
        if self.shared.is_none() {
            shared_ttl = None;
        }

        let mut secondary_fields = Row::new();
        let secondary = options.cache_key_name.as_ref().and_then(|name| {
            let columns = cfg.keys.get(name)?;
            let key = cache_key(&format!("{prefix}:{name}"), columns, object)?;
            secondary_fields = columns.iter().filter_map(|c| Some((c.clone(), object.get(c)?.clone()))).collect();
            Some(key)
        });
        let plan = CachePlan {
            table: table.to_string(),
            primary: cache_key(&prefix, keys, object),
            secondary,
            secondary_fields,
            local_ttl: local_ttl.map(Duration::from_millis),
            shared_ttl: shared_ttl.map(Duration::from_millis),
            prefix,
            keys: keys.to_vec(),
        };
        (plan.primary.is_some() || plan.secondary.is_some()).then_some(plan)
    }

    /// Cached record for `plan` and the tier it came from.
    pub async fn read(&self, plan: &CachePlan) -> Option<(Row, u8)> {
        let primary = match (&plan.secondary, &plan.primary) {
            (Some(secondary), _) => match self.lookup(plan, secondary).await {
                Some((Value::String(primary), _)) => primary,
                _ => {
                    crate::metrics::record_cache_miss(&plan.table);
                    return None;
                }
            },
            (None, Some(primary)) => primary.clone(),
            (None, None) => return None,
        };
        match self.lookup(plan, &primary).await {
            Some((Value::Object(row), _)) if !self.pointer_holds(plan, &row) => {
                // The record moved away from this secondary key.
                if let Some(secondary) = &plan.secondary {
                    self.drop_keys(std::slice::from_ref(secondary)).await;
                }
                crate::metrics::record_cache_miss(&plan.table);
                None
            }
            Some((Value::Object(row), tier)) => {
                crate::metrics::record_cache_hit(&plan.table, if tier == LOCAL_HIT { "local" } else { "shared" });
                Some((row, tier))
            }
            _ => {
                crate::metrics::record_cache_miss(&plan.table);
                None
            }
        }
    }

    fn pointer_holds(&self, plan: &CachePlan, row: &Row) -> bool {
        plan.secondary.is_none()
            || plan
                .secondary_fields
                .iter()
                .all(|(column, expected)| row.get(column).is_some_and(|v| key_part(v) == key_part(expected)))
    }

    async fn lookup(&self, plan: &CachePlan, key: &str) -> Option<(Value, u8)> {
        if plan.local_ttl.is_some() {
            if let Some(value) = self.local.get(key) {
                return Some((value, LOCAL_HIT));
            }
        }
        plan.shared_ttl?;
        let text = self.shared_call(|shared| async move { shared.get(key).await }).await??;
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "discarding unreadable shared cache entry");
                return None;
            }
        };
        // Refill the local tier so the next read stays in-process.
        if let Some(ttl) = plan.local_ttl {
            self.local.insert(key.to_string(), value.clone(), ttl);
        }
        Some((value, SHARED_HIT))
    }

    /// Store a fetched record in both tiers, plus the secondary pointer.
    pub async fn store(&self, plan: &CachePlan, row: &Row) {
        let Some(primary) = plan.primary_of(row) else {
            return;
        };
        let value = Value::Object(row.clone());
        self.put(plan, &primary, value).await;
        if let Some(secondary) = &plan.secondary {
            self.put(plan, secondary, Value::String(primary)).await;
        }
    }

    /// Point every declared secondary key derivable from `row` at its
    /// primary key. Used after `add`.
    pub async fn store_secondary(&self, pool: &str, table: &str, keys: &[String], row: &Row) {
        let Some(cfg) = self.table_config(pool, table) else {
            return;
        };
        let options = QueryOptions::default();
        let Some(plan) = self.plan(pool, table, keys, row, &options) else {
            return;
        };
        let Some(primary) = plan.primary.clone() else {
            return;
        };
        for (name, columns) in &cfg.keys {
            if let Some(secondary) = cache_key(&format!("{}:{name}", plan.prefix), columns, row) {
                self.put(&plan, &secondary, Value::String(primary.clone())).await;
            }
        }
    }

    async fn put(&self, plan: &CachePlan, key: &str, value: Value) {
        if let Some(ttl) = plan.local_ttl {
            self.local.insert(key.to_string(), value.clone(), ttl);
        }
        if let Some(ttl) = plan.shared_ttl {
            let text = value.to_string();
            self.shared_call(|shared| async move { shared.set(key, &text, ttl).await }).await;
        }
    }

    /// Drop the record derived from `row` and every secondary key built
    /// from either its new values (`row`, alone or over the cached copy) or
    /// the old ones (the cached copy).
    pub async fn invalidate(&self, pool: &str, table: &str, keys: &[String], row: &Row) {
        let Some(cfg) = self.table_config(pool, table) else {
            return;
        };
        let prefix = cfg.prefix.clone().unwrap_or_else(|| table.to_string());
        let Some(primary) = cache_key(&prefix, keys, row) else {
            return;
        };
        let mut images = vec![row.clone()];
        if let Some(old) = self.cached_record(&primary).await {
            let mut merged = old.clone();
            merged.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
            images.push(old);
            images.push(merged);
        }
        let mut doomed = vec![primary];
        for image in &images {
            for (name, columns) in &cfg.keys {
                if let Some(key) = cache_key(&format!("{prefix}:{name}"), columns, image) {
                    if !doomed.contains(&key) {
                        doomed.push(key);
                    }
                }
            }
        }
        self.drop_keys(&doomed).await;
        crate::metrics::record_cache_invalidation(table, doomed.len());
        debug!(table, keys = doomed.len(), "cache invalidated");
    }

    /// Cached copy of a record from whichever tier still has it.
    async fn cached_record(&self, primary: &str) -> Option<Row> {
        let value = match self.local.get(primary) {
            Some(value) => value,
            None => {
                let text = self.shared_call(|shared| async move { shared.get(primary).await }).await??;
                serde_json::from_str(&text).ok()?
            }
        };
        match value {
            Value::Object(row) => Some(row),
            _ => None,
        }
    }

    async fn drop_keys(&self, keys: &[String]) {
        for key in keys {
            self.local.remove(key);
        }
        if self.shared.is_some() {
            self.shared_call(|shared| async move { shared.del(keys).await }).await;
        }
    }

    /// Run a shared-tier call through the breaker; failures become `None`.
    async fn shared_call<'a, F, Fut, T>(&'a self, f: F) -> Option<T>
    where
        F: FnOnce(&'a dyn SharedCache) -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<T>>,
    {
        let shared = self.shared.as_deref()?;
        match self.breaker.call(|| f(shared)).await {
            Ok(value) => Some(value),
            Err(CircuitError::Rejected) => {
                crate::metrics::record_cache_error("shared");
                None
            }
            Err(CircuitError::Inner(e)) => {
                crate::metrics::record_cache_error("shared");
                debug!(error = %e, "shared cache call failed, treating as a miss");
                None
            }
        }
    }
}
