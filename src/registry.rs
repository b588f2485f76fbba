// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pool registry.
//!
//! Owns every configured [`Pool`], the alias table and the default pool
//! name. [`Registry::get_pool`] always answers: an unknown name resolves to
//! a no-op pool that returns empty results, so a misconfigured caller
//! degrades instead of failing.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! Live configuration arrives on a `watch` channel; see
//! [`Registry::watch_config`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{none::NoneAdapter, AdapterRegistry};
use crate::config::{PoolConfig, RegistryConfig};
use crate::error::Result;
use crate::pool::{Managed, Pool, PoolStats};
use crate::schema::TableSpec;

/// Name of the fallback pool.
pub const NONE_POOL: &str = "none";

/// How often idle clients past their timeout are closed.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Registry lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Created,
    /// Opening `min` clients and loading table metadata
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for RegistryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Ready => write!(f, "Ready"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

pub struct Registry {
    adapters: AdapterRegistry,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    aliases: RwLock<HashMap<String, String>>,
    default_pool: RwLock<String>,
    tables: RwLock<HashMap<String, TableSpec>>,
    none: Arc<Pool>,
    state: watch::Sender<RegistryState>,
}

impl Registry {
    /// Registry over the built-in adapter kinds.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        Self::with_adapters(config, AdapterRegistry::builtin())
    }

    pub fn with_adapters(config: &RegistryConfig, adapters: AdapterRegistry) -> Result<Self> {
        let none_cfg = PoolConfig::new(NONE_POOL, "none");
        let none = Arc::new(Pool::new(none_cfg.clone(), Managed::engine(&none_cfg, NoneAdapter)));
        let (state, _) = watch::channel(RegistryState::Created);
        let registry = Self {
            adapters,
            pools: RwLock::new(HashMap::new()),
            aliases: RwLock::new(config.aliases.clone()),
            default_pool: RwLock::new(config.default_pool.clone()),
            tables: RwLock::new(config.tables.clone()),
            none,
            state,
        };
        for pool in &config.pools {
            registry.add_pool(pool.clone())?;
        }
        crate::metrics::set_pool_count(registry.pools.read().len());
        Ok(registry)
    }

    #[must_use]
    pub fn state(&self) -> RegistryState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<RegistryState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Pool name for `name` after alias and default resolution.
    #[must_use]
    pub fn resolve_name(&self, name: Option<&str>) -> String {
        let name = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => self.default_pool.read().clone(),
        };
        self.aliases.read().get(&name).cloned().unwrap_or(name)
    }

    /// The pool for `name` (or the default pool); the no-op pool when
    /// nothing matches.
    #[must_use]
    pub fn get_pool(&self, name: Option<&str>) -> Arc<Pool> {
        let resolved = self.resolve_name(name);
        match self.pools.read().get(&resolved) {
            Some(pool) => Arc::clone(pool),
            None => {
                debug!(pool = %resolved, "unknown pool, using none");
                Arc::clone(&self.none)
            }
        }
    }

    /// Exact lookup without the no-op fallback.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(name).cloned()
    }

    #[must_use]
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Build and register a pool, replacing any pool of the same name.
    pub fn add_pool(&self, config: PoolConfig) -> Result<Arc<Pool>> {
        let engine = self.adapters.build(&config)?;
        let pool = Arc::new(Pool::new(config.clone(), engine));
        for (table, spec) in self.tables.read().iter() {
            pool.describe_table(table, spec.clone());
        }
        if let Some(previous) = self.pools.write().insert(config.name.clone(), Arc::clone(&pool)) {
            previous.shutdown();
        }
        info!(pool = %config.name, kind = %config.kind, "pool registered");
        Ok(pool)
    }

    /// Merge `config` into the live pool of the same name, or add it. Options
    /// are merged key by key; in-flight requests keep their clients.
    pub fn configure(&self, mut config: PoolConfig) -> Result<()> {
        let Some(pool) = self.pool(&config.name) else {
            self.add_pool(config)?;
            crate::metrics::set_pool_count(self.pools.read().len());
            return Ok(());
        };
        let current = pool.config();
        let mut options = current.options.clone();
        options.extend(config.options.drain());
        config.options = options;
        // The memory store reads nothing from its config, so it survives
        // option changes.
        let keep_store = current.kind.eq_ignore_ascii_case("memory") && current.kind == config.kind;
        let rebuilt = if current.needs_reconnect(&config) && !keep_store {
            if current.is_in_process() {
                warn!(pool = %config.name, kind = %current.kind, "rebuilding in-process pool, stored rows are discarded");
            }
            Some(self.adapters.build(&config)?)
        } else {
            None
        };
        pool.configure(config, rebuilt);
        Ok(())
    }

    /// Declare a table on every pool.
    pub fn describe_table(&self, table: &str, spec: TableSpec) {
        for pool in self.pools.read().values() {
            pool.describe_table(table, spec.clone());
        }
        self.tables.write().insert(table.to_string(), spec);
    }

    /// Apply a whole configuration: defaults, aliases, declared tables and
    /// pools. Pools missing from `config` are shut down and removed.
    pub fn apply_config(&self, config: &RegistryConfig) -> Result<()> {
        *self.default_pool.write() = config.default_pool.clone();
        *self.aliases.write() = config.aliases.clone();
        for (table, spec) in &config.tables {
            self.describe_table(table, spec.clone());
        }
        for pool in &config.pools {
            self.configure(pool.clone())?;
        }
        let removed: Vec<Arc<Pool>> = {
            let mut pools = self.pools.write();
            let gone: Vec<String> = pools.keys().filter(|n| config.pool(n).is_none()).cloned().collect();
            gone.iter().filter_map(|n| pools.remove(n)).collect()
        };
        for pool in removed {
            info!(pool = %pool.name(), "pool removed from configuration");
            pool.shutdown();
        }
        crate::metrics::set_pool_count(self.pools.read().len());
        Ok(())
    }

    /// Follow configuration updates and sweep idle clients until the
    /// channel closes. `on_change` runs after each applied update.
    pub fn watch_config<F>(self: &Arc<Self>, mut rx: watch::Receiver<RegistryConfig>, on_change: F) -> JoinHandle<()>
    where
        F: Fn(&RegistryConfig) + Send + Sync + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("configuration channel closed");
                            break;
                        }
                        let config = rx.borrow_and_update().clone();
                        match registry.apply_config(&config) {
                            Ok(()) => {
                                info!(pools = config.pools.len(), "configuration applied");
                                on_change(&config);
                            }
                            Err(e) => error!(error = %e, "failed to apply configuration"),
                        }
                    }
                    _ = sweep.tick() => {
                        let closed = registry.expire_idle();
                        if closed > 0 {
                            debug!(closed, "closed idle clients");
                        }
                    }
                }
            }
        })
    }

    /// Close idle clients past their pool's idle timeout.
    pub fn expire_idle(&self) -> usize {
        self.pools.read().values().map(|p| p.engine().expire_idle()).sum()
    }

    /// Open `min` clients per pool, load table metadata and create declared
    /// tables. A pool that fails to start fails the whole start.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let started = std::time::Instant::now();
        self.state.send_replace(RegistryState::Starting);
        let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
        let has_tables = !self.tables.read().is_empty();
        for pool in pools {
            if let Err(e) = pool.start().await {
                error!(pool = %pool.name(), error = %e, "pool failed to start");
                self.state.send_replace(RegistryState::Created);
                return Err(e);
            }
            if has_tables {
                if let Err(e) = pool.init_tables().await {
                    warn!(pool = %pool.name(), error = %e, "declared tables not initialised");
                }
            }
        }
        self.state.send_replace(RegistryState::Ready);
        crate::metrics::record_startup_phase("registry_start", started.elapsed());
        info!(pools = self.pools.read().len(), "registry ready");
        Ok(())
    }

    /// Drain every pool.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) {
        self.state.send_replace(RegistryState::ShuttingDown);
        for pool in self.pools.read().values() {
            pool.shutdown();
        }
        self.none.shutdown();
        self.state.send_replace(RegistryState::Stopped);
        info!("registry shut down");
    }

    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.read().values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("pools", &self.pool_names())
            .field("default_pool", &*self.default_pool.read())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Op, Request};
    use crate::schema::ColumnType;
    use serde_json::json;

    fn config() -> RegistryConfig {
        RegistryConfig {
            default_pool: "main".into(),
            pools: vec![PoolConfig::new("main", "memory"), PoolConfig::new("side", "memory")],
            aliases: HashMap::from([("primary".to_string(), "main".to_string())]),
            ..RegistryConfig::default()
        }
    }

    #[test]
    fn test_resolution() {
        let reg = Registry::new(&config()).unwrap();
        assert_eq!(reg.get_pool(None).name(), "main");
        assert_eq!(reg.get_pool(Some("primary")).name(), "main");
        assert_eq!(reg.get_pool(Some("side")).name(), "side");
        assert_eq!(reg.get_pool(Some("missing")).name(), NONE_POOL);
        assert_eq!(reg.pool_names(), vec!["main", "side"]);
    }

    #[tokio::test]
    async fn test_unknown_pool_answers_empty() {
        let reg = Registry::new(&config()).unwrap();
        let pool = reg.get_pool(Some("nowhere"));
        let res = pool.query(&Request::new(Op::Get, "users", json!({"id": "1"}))).await.unwrap();
        assert!(res.rows.is_empty());
    }

    #[tokio::test]
    async fn test_start_creates_declared_tables() {
        let mut cfg = config();
        cfg.tables.insert("users".into(), TableSpec::new().primary("id", ColumnType::Text).column("name", ColumnType::Text));
        let reg = Registry::new(&cfg).unwrap();
        let mut states = reg.state_receiver();
        reg.start().await.unwrap();
        assert_eq!(*states.borrow_and_update(), RegistryState::Ready);
        assert_eq!(reg.get_pool(None).table_info("users").keys, vec!["id".to_string()]);

        reg.shutdown();
        assert_eq!(reg.state(), RegistryState::Stopped);
    }

    #[test]
    fn test_configure_merges_options() {
        let reg = Registry::new(&config()).unwrap();
        reg.configure(PoolConfig::new("main", "memory").with_option("a", json!(1))).unwrap();
        let mut next = PoolConfig::new("main", "memory").with_option("b", json!(2));
        next.max = 4;
        reg.configure(next).unwrap();
        let live = reg.pool("main").unwrap().config();
        assert_eq!(live.options.get("a"), Some(&json!(1)));
        assert_eq!(live.options.get("b"), Some(&json!(2)));
        assert_eq!(live.max, 4);

        reg.configure(PoolConfig::new("extra", "none")).unwrap();
        assert!(reg.pool("extra").is_some());
    }

    #[tokio::test]
    async fn test_memory_pool_keeps_rows_across_option_changes() {
        let mut cfg = config();
        cfg.tables.insert("users".into(), TableSpec::new().primary("id", ColumnType::Text).column("name", ColumnType::Text));
        let reg = Registry::new(&cfg).unwrap();
        reg.start().await.unwrap();
        let add = Request::new(Op::Add, "users", json!({"id": "1", "name": "ann"}));
        reg.get_pool(None).query(&add).await.unwrap();

        reg.configure(PoolConfig::new("main", "memory").with_option("tuning", json!(true))).unwrap();
        let pool = reg.get_pool(None);
        assert_eq!(pool.config().options.get("tuning"), Some(&json!(true)));
        let res = pool.query(&Request::new(Op::Get, "users", json!({"id": "1"}))).await.unwrap();
        assert_eq!(res.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_config_applies_updates() {
        let reg = Arc::new(Registry::new(&config()).unwrap());
        let (tx, rx) = watch::channel(config());
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = reg.watch_config(rx, move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let mut next = config();
        next.pools.retain(|p| p.name == "main");
        next.aliases.insert("other".into(), "main".into());
        tx.send(next).unwrap();
        for _ in 0..50 {
            if seen.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reg.pool_names(), vec!["main"]);
        assert_eq!(reg.get_pool(Some("other")).name(), "main");

        drop(tx);
        handle.await.unwrap();
    }
}
