// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the registry, its pools and the cache layer.
//!
//! # Example
//!
//! ```
//! use polystore::config::{RegistryConfig, PoolConfig};
//!
//! // Minimal pool (uses defaults)
//! let pool = PoolConfig::new("main", "memory");
//! assert_eq!(pool.max, 10);
//! assert_eq!(pool.max_queue, 100);
//!
//! // Full config
//! let config = RegistryConfig {
//!     default_pool: "main".into(),
//!     pools: vec![
//!         pool,
//!         PoolConfig { max: 0, ..PoolConfig::new("kv", "lmdb") },
//!     ],
//!     ..Default::default()
//! };
//! assert!(config.pool("kv").unwrap().is_unbounded());
//! ```

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::schema::TableSpec;

/// Top-level configuration: every pool, aliases, declared tables, cache.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryConfig {
    /// Pool used when a request names none (default: "default")
    #[serde(default = "default_pool_name")]
    pub default_pool: String,

    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Friendly name → pool name
    #[serde(default)]
    pub aliases: HashMap<String, String>,

    /// Declared tables, applied to every pool that hosts them
    #[serde(default)]
    pub tables: HashMap<String, TableSpec>,

    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_pool_name() -> String { "default".to_string() }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_pool: default_pool_name(),
            pools: Vec::new(),
            aliases: HashMap::new(),
            tables: HashMap::new(),
            cache: CacheConfig::default(),
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }
}

/// One configured backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PoolConfig {
    pub name: String,

    /// Adapter kind ("sqlite", "redis", "cassandra", ...)
    pub kind: String,

    /// Native connection string; empty selects the in-process client
    #[serde(default)]
    pub url: String,

    /// Clients opened at startup
    #[serde(default)]
    pub min: usize,

    /// Live client ceiling (0 = unbounded)
    #[serde(default = "default_max")]
    pub max: usize,

    /// Callers allowed to wait for a client before `QueueFull`
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Idle clients older than this are destroyed (0 = never)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Attempts to open a native client before giving up
    #[serde(default = "default_create_retries")]
    pub create_retries: usize,

    /// Adapter-specific settings (keyspace, database, bucket type, ...)
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

fn default_max() -> usize { 10 }
fn default_max_queue() -> usize { 100 }
fn default_acquire_timeout_ms() -> u64 { 5_000 }
fn default_idle_timeout_ms() -> u64 { 60_000 }
fn default_create_retries() -> usize { 3 }

impl PoolConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            url: String::new(),
            min: 0,
            max: default_max(),
            max_queue: default_max_queue(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            create_retries: default_create_retries(),
            options: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: &str, value: Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.max == 0
    }

    /// String adapter option.
    #[must_use]
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// Whether the backend lives inside this process, so rebuilding the
    /// engine starts it empty.
    #[must_use]
    pub fn is_in_process(&self) -> bool {
        match self.kind.to_lowercase().as_str() {
            "memory" => true,
            "redis" | "cassandra" | "mongodb" | "couchdb" | "riak" => {
                self.url.is_empty() || self.url.starts_with("memory:")
            }
            _ => false,
        }
    }

    /// Whether anything that requires reopening clients changed.
    #[must_use]
    pub fn needs_reconnect(&self, other: &PoolConfig) -> bool {
        self.kind != other.kind || self.url != other.url || self.options != other.options
    }
}

/// Cache layer settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Shared tier; none keeps the cache process-local
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Entries kept in the local tier before expired ones are swept
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    /// Consecutive shared-tier failures before the breaker opens
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: u32,

    /// Per-table TTLs and key sets, by canonical table name
    #[serde(default)]
    pub tables: HashMap<String, TableCacheConfig>,
}

fn default_cache_enabled() -> bool { true }
fn default_local_max_entries() -> usize { 100_000 }
fn default_breaker_failures() -> u32 { 5 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            redis_url: None,
            local_max_entries: default_local_max_entries(),
            breaker_failures: default_breaker_failures(),
            tables: HashMap::new(),
        }
    }
}

/// Cache declaration for one table. A tier with no TTL is disabled.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TableCacheConfig {
    /// Shared-tier TTL in ms
    #[serde(default)]
    pub ttl: Option<u64>,

    /// Local-tier TTL in ms, kept shorter than `ttl`
    #[serde(default)]
    pub local_ttl: Option<u64>,

    /// Key prefix (default: canonical table name)
    #[serde(default)]
    pub prefix: Option<String>,

    /// Named secondary key sets: name → columns
    #[serde(default)]
    pub keys: HashMap<String, Vec<String>>,
}

impl TableCacheConfig {
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.ttl.is_some() || self.local_ttl.is_some()
    }

    /// Local TTL clamped below the shared TTL.
    #[must_use]
    pub fn effective_local_ttl(&self) -> Option<u64> {
        match (self.local_ttl, self.ttl) {
            (Some(local), Some(shared)) if local >= shared => Some(shared.saturating_sub(1).max(1)),
            (local, _) => local,
        }
    }
}
