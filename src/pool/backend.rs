// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Type-erased adapter + client pool.
//!
//! [`Managed`] pairs one [`Adapter`] with a [`ClientPool`] of its native
//! clients and exposes the result as a `dyn` [`Engine`], which is what a
//! [`Pool`](super::Pool) and the registry hold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::clients::{ClientPool, CoreStats, Manager, PoolOptions};
use crate::adapters::Adapter;
use crate::config::PoolConfig;
use crate::error::{DbError, Result};
use crate::metrics;
use crate::request::{Capabilities, Op, PreparedRequest, QueryResult};
use crate::resilience::{retry_if, RetryConfig};
use crate::schema::TableInfo;

/// What a pool needs from its backend, independent of the client type.
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    async fn execute(&self, req: &PreparedRequest) -> Result<QueryResult>;

    async fn cache_columns(&self) -> Result<HashMap<String, TableInfo>>;

    async fn prefill(&self, n: usize) -> Result<usize>;

    fn resize(&self, options: PoolOptions);

    fn stats(&self) -> CoreStats;

    /// Destroy idle clients and refuse new checkouts.
    fn shutdown(&self);

    /// Stop reusing clients but let queued callers finish.
    fn retire(&self);

    fn expire_idle(&self) -> usize;
}

/// Pool core options from a pool configuration.
#[must_use]
pub fn pool_options(cfg: &PoolConfig) -> PoolOptions {
    PoolOptions {
        max: cfg.max,
        max_queue: cfg.max_queue,
        acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms),
        idle_timeout: Duration::from_millis(cfg.idle_timeout_ms),
    }
}

struct AdapterManager<A: Adapter> {
    adapter: Arc<A>,
}

#[async_trait]
impl<A: Adapter> Manager for AdapterManager<A> {
    type Client = A::Client;

    async fn create(&self) -> Result<A::Client> {
        self.adapter.open().await
    }

    fn reset(&self, client: &mut A::Client) -> bool {
        self.adapter.reset(client)
    }

    fn destroy(&self, client: A::Client) {
        self.adapter.close(client);
    }
}

/// An adapter and the pool of its clients.
pub struct Managed<A: Adapter> {
    name: String,
    adapter: Arc<A>,
    core: ClientPool<AdapterManager<A>>,
    retry: RetryConfig,
}

impl<A: Adapter> Managed<A> {
    pub fn new(cfg: &PoolConfig, adapter: A) -> Self {
        let adapter = Arc::new(adapter);
        let manager = AdapterManager { adapter: adapter.clone() };
        Self {
            name: cfg.name.clone(),
            adapter,
            core: ClientPool::new(cfg.name.clone(), manager, pool_options(cfg)),
            retry: RetryConfig::connect(cfg.create_retries),
        }
    }

    /// Boxed as a `dyn Engine`.
    pub fn engine(cfg: &PoolConfig, adapter: A) -> Arc<dyn Engine> {
        Arc::new(Self::new(cfg, adapter))
    }

    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    async fn checkout(&self) -> Result<super::clients::PooledClient<AdapterManager<A>>> {
        let name = &self.name;
        let mut attempt = 0u32;
        retry_if(
            &format!("open {name}"),
            &self.retry,
            || {
                attempt += 1;
                if attempt > 1 {
                    metrics::record_create_retry(name);
                }
                self.core.acquire()
            },
            |e: &DbError| matches!(e, DbError::Connect { .. }) && !self.core.is_closed(),
        )
        .await
    }
}

fn taints_client(err: &DbError) -> bool {
    matches!(err, DbError::Backend { .. } | DbError::Connect { .. })
}

#[async_trait]
impl<A: Adapter> Engine for Managed<A> {
    fn kind(&self) -> &'static str {
        self.adapter.kind()
    }

    fn capabilities(&self) -> Capabilities {
        self.adapter.capabilities()
    }

    async fn execute(&self, req: &PreparedRequest) -> Result<QueryResult> {
        let mut client = self.checkout().await?;
        match self.adapter.query(&mut client, req).await {
            Ok(mut result) => {
                if req.op == Op::Select && result.info.next_token.is_none() {
                    result.info.next_token = self.adapter.next_token(req, &result.rows);
                }
                Ok(result)
            }
            Err(e) => {
                if taints_client(&e) {
                    client.discard();
                }
                Err(e)
            }
        }
    }

    async fn cache_columns(&self) -> Result<HashMap<String, TableInfo>> {
        let mut client = self.checkout().await?;
        let result = self.adapter.cache_columns(&mut client).await;
        if let Err(e) = &result {
            if taints_client(e) {
                client.discard();
            }
        }
        result
    }

    async fn prefill(&self, n: usize) -> Result<usize> {
        self.core.prefill(n).await
    }

    fn resize(&self, options: PoolOptions) {
        self.core.resize(options);
    }

    fn stats(&self) -> CoreStats {
        self.core.stats()
    }

    fn shutdown(&self) {
        self.core.shutdown();
    }

    fn retire(&self) {
        self.core.retire();
    }

    fn expire_idle(&self) -> usize {
        self.core.expire_idle()
    }
}
