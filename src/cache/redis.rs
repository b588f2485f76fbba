// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared cache tier.
//!
//! Values are JSON text under the literal cache key, with a millisecond
//! expiry (`SET key value PX ttl`), so entries written by one process are
//! hits for every other process using the same Redis.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::error::{DbError, Result};
use crate::resilience::{retry, RetryConfig};

/// Distributed key/value tier shared between processes.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn del(&self, keys: &[String]) -> Result<()>;
}

pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| DbError::Cache(e.to_string()))?;
        let connection = retry("cache_redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| DbError::Cache(e.to_string()))?;
        Ok(Self { connection })
    }
}

fn cache_error(e: redis::RedisError) -> DbError {
    DbError::Cache(e.to_string())
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(cache_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex(key, value, ms).await.map_err(cache_error)
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        conn.del(keys).await.map_err(cache_error)
    }
}
