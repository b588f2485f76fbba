// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Polystore
//!
//! One request model over many storage engines.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Db                                 │
//! │  • get / select / list / add / put / update / incr / del   │
//! │  • create / upgrade / drop                                 │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                 │
//!              ▼                                 ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │      Cache layer          │   │        Registry             │
//! │  • local tier (DashMap)   │   │  • pools by name / alias    │
//! │  • shared tier (Redis)    │   │  • unknown name → none pool │
//! │  • circuit breaker        │   │  • hot config reload        │
//! └───────────────────────────┘   └─────────────────────────────┘
//!                                                │
//!                                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Pool                               │
//! │  • bounded client pool with FIFO waiters                   │
//! │  • schema cache (columns, keys, indexes)                   │
//! │  • prepare: native vs emulated filter/sort split           │
//! └─────────────────────────────────────────────────────────────┘
//!                                                │
//!                                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters                             │
//! │  SQL · Cassandra · MongoDB · CouchDB · Redis · Riak · LMDB │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use polystore::{Db, PoolConfig, QueryOptions, RegistryConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> polystore::Result<()> {
//!     let config = RegistryConfig {
//!         pools: vec![PoolConfig::new("default", "sqlite").with_url("sqlite://app.db?mode=rwc")],
//!         ..Default::default()
//!     };
//!     let db = Db::connect(&config).await?;
//!     db.start().await?;
//!
//!     db.add("users", json!({"id": "u1", "name": "ann"}), QueryOptions::default()).await?;
//!     let res = db.get("users", json!({"id": "u1"}), QueryOptions::default()).await?;
//!     println!("{:?}", res.first());
//!
//!     db.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`db`]: the [`Db`] service
//! - [`registry`]: named pools, aliases and lifecycle
//! - [`pool`]: client pool, schema cache and request dispatch
//! - [`request`]: request model and the native/emulated split
//! - [`adapters`]: one adapter per storage engine
//! - [`emulation`]: in-memory filter, sort and key helpers
//! - [`cache`]: two-tier record cache
//! - [`resilience`]: connect retry and circuit breaker

pub mod adapters;
pub mod cache;
pub mod config;
pub mod db;
pub mod emulation;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod request;
pub mod resilience;
pub mod schema;

pub use adapters::{Adapter, AdapterRegistry};
pub use cache::{CacheLayer, LocalCache, RedisCache, SharedCache};
pub use config::{CacheConfig, PoolConfig, RegistryConfig, TableCacheConfig};
pub use db::Db;
pub use error::{DbError, Result};
pub use metrics::LatencyTimer;
pub use pool::{Engine, Pool, PoolStats};
pub use registry::{Registry, RegistryState};
pub use request::{FieldOp, Op, QueryInfo, QueryOptions, QueryResult, Request, Row};
pub use resilience::{CircuitBreaker, CircuitConfig, CircuitError, RetryConfig};
pub use schema::{ColumnSpec, ColumnType, TableInfo, TableSpec};
