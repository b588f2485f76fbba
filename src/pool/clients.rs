// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Generic bounded client pool.
//!
//! - Never more than `max` live clients (`max = 0`: unbounded).
//! - When exhausted, callers wait, but at most `max_queue` of them; the next
//!   one fails immediately with [`DbError::QueueFull`].
//! - `reset` runs before a client re-enters the free list; a client that
//!   fails reset, was marked broken, or sat idle too long is destroyed.
//! - A failed `create` is returned to the caller; retrying is its business.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::{DbError, Result};
use crate::metrics;

/// Client lifecycle hooks.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Client: Send + 'static;

    async fn create(&self) -> Result<Self::Client>;

    /// Clear session state; `false` destroys the client instead of reusing it.
    fn reset(&self, _client: &mut Self::Client) -> bool {
        true
    }

    fn destroy(&self, client: Self::Client) {
        drop(client);
    }
}

/// Sizing and timing knobs, changeable on a live pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max: usize,
    pub max_queue: usize,
    pub acquire_timeout: Duration,
    /// Zero keeps idle clients forever.
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max: 10,
            max_queue: 100,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStats {
    pub live: usize,
    pub idle: usize,
    pub waiting: usize,
}

struct Idle<C> {
    client: C,
    since: Instant,
}

struct Shared<M: Manager> {
    name: String,
    manager: M,
    options: Mutex<PoolOptions>,
    idle: Mutex<VecDeque<Idle<M::Client>>>,
    permits: Arc<Semaphore>,
    /// Permits the semaphore currently represents (`max` when bounded).
    capacity: Mutex<usize>,
    /// Permits to forget on release after `max` shrank below what was in use.
    shrink_debt: AtomicUsize,
    live: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
}

impl<M: Manager> Shared<M> {
    fn destroy(&self, client: M::Client, reason: &str) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.manager.destroy(client);
        metrics::record_client_event(&self.name, reason);
        trace!(pool = %self.name, reason, "client destroyed");
    }

    fn release_permit(&self, permit: OwnedSemaphorePermit) {
        let mut debt = self.shrink_debt.load(Ordering::Acquire);
        while debt > 0 {
            match self.shrink_debt.compare_exchange(debt, debt - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    permit.forget();
                    return;
                }
                Err(actual) => debt = actual,
            }
        }
        drop(permit);
    }

    fn publish(&self) {
        metrics::set_pool_clients(&self.name, self.live.load(Ordering::Acquire), self.idle.lock().len());
    }
}

/// Bounded pool of `M::Client`.
pub struct ClientPool<M: Manager> {
    shared: Arc<Shared<M>>,
}

impl<M: Manager> Clone for ClientPool<M> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

/// Decrements the waiting counter even when the acquiring future is dropped.
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<M: Manager> ClientPool<M> {
    pub fn new(name: impl Into<String>, manager: M, options: PoolOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                manager,
                options: Mutex::new(options),
                idle: Mutex::new(VecDeque::new()),
                permits: Arc::new(Semaphore::new(options.max)),
                capacity: Mutex::new(options.max),
                shrink_debt: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    #[must_use]
    pub fn options(&self) -> PoolOptions {
        *self.shared.options.lock()
    }

    #[must_use]
    pub fn stats(&self) -> CoreStats {
        CoreStats {
            live: self.shared.live.load(Ordering::Acquire),
            idle: self.shared.idle.lock().len(),
            waiting: self.shared.waiting.load(Ordering::Acquire),
        }
    }

    /// Check a client out, creating one if none is idle.
    pub async fn acquire(&self) -> Result<PooledClient<M>> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(DbError::connect(&shared.name, "pool is shut down"));
        }
        let opts = self.options();

        let permit = if opts.max == 0 {
            None
        } else {
            match shared.permits.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => Some(self.wait_for_permit(&opts).await?),
            }
        };

        loop {
            let next = shared.idle.lock().pop_back();
            match next {
                Some(idle) if !opts.idle_timeout.is_zero() && idle.since.elapsed() > opts.idle_timeout => {
                    shared.destroy(idle.client, "expired");
                }
                Some(idle) => {
                    return Ok(PooledClient::new(shared.clone(), idle.client, permit));
                }
                None => break,
            }
        }
        self.open(permit).await
    }

    /// Create a fresh client under `permit`, bypassing the idle list.
    async fn open(&self, permit: Option<OwnedSemaphorePermit>) -> Result<PooledClient<M>> {
        let shared = &self.shared;
        shared.live.fetch_add(1, Ordering::AcqRel);
        match shared.manager.create().await {
            Ok(client) => {
                metrics::record_client_event(&shared.name, "created");
                debug!(pool = %shared.name, live = shared.live.load(Ordering::Acquire), "client created");
                shared.publish();
                Ok(PooledClient::new(shared.clone(), client, permit))
            }
            Err(e) => {
                shared.live.fetch_sub(1, Ordering::AcqRel);
                if let Some(permit) = permit {
                    shared.release_permit(permit);
                }
                Err(e)
            }
        }
    }

    async fn wait_for_permit(&self, opts: &PoolOptions) -> Result<OwnedSemaphorePermit> {
        let shared = &self.shared;
        let waiting = shared.waiting.fetch_add(1, Ordering::AcqRel);
        let _guard = WaitGuard(&shared.waiting);
        if waiting >= opts.max_queue {
            return Err(DbError::QueueFull { pool: shared.name.clone(), waiting });
        }
        metrics::record_queue_depth(&shared.name, waiting + 1);

        let started = Instant::now();
        let acquired = tokio::time::timeout(opts.acquire_timeout, shared.permits.clone().acquire_owned()).await;
        metrics::record_acquire_wait(&shared.name, started.elapsed());
        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(DbError::connect(&shared.name, "pool is shut down")),
            Err(_) => Err(DbError::AcquireTimeout { pool: shared.name.clone() }),
        }
    }

    /// Open new clients until `n` are idle (bounded by `max`).
    pub async fn prefill(&self, n: usize) -> Result<usize> {
        if self.is_closed() {
            return Err(DbError::connect(&self.shared.name, "pool is shut down"));
        }
        let max = self.options().max;
        let bounded = max > 0;
        let mut target = n.saturating_sub(self.shared.idle.lock().len());
        if bounded {
            target = target.min(max.saturating_sub(self.shared.live.load(Ordering::Acquire)));
        }
        let mut created = Vec::with_capacity(target);
        for _ in 0..target {
            let permit = if bounded {
                match self.shared.permits.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                }
            } else {
                None
            };
            created.push(self.open(permit).await?);
        }
        let count = created.len();
        drop(created);
        Ok(count)
    }

    /// Apply new sizing to a live pool. In-use clients are unaffected;
    /// a smaller `max` takes effect as clients are released.
    pub fn resize(&self, options: PoolOptions) {
        let shared = &self.shared;
        *shared.options.lock() = options;
        if options.max == 0 {
            return;
        }
        let mut capacity = shared.capacity.lock();
        if options.max > *capacity {
            let mut grow = options.max - *capacity;
            let debt = shared.shrink_debt.swap(0, Ordering::AcqRel);
            let cancelled = debt.min(grow);
            grow -= cancelled;
            shared.shrink_debt.fetch_add(debt - cancelled, Ordering::AcqRel);
            shared.permits.add_permits(grow);
        } else if options.max < *capacity {
            let shrink = *capacity - options.max;
            let forgotten = shared.permits.forget_permits(shrink);
            shared.shrink_debt.fetch_add(shrink - forgotten, Ordering::AcqRel);
        }
        *capacity = options.max;
        debug!(pool = %shared.name, max = options.max, "pool resized");
    }

    /// Destroy idle clients older than the idle timeout.
    pub fn expire_idle(&self) -> usize {
        let timeout = self.options().idle_timeout;
        if timeout.is_zero() {
            return 0;
        }
        let expired: Vec<M::Client> = {
            let mut idle = self.shared.idle.lock();
            let (old, keep): (VecDeque<_>, VecDeque<_>) = idle.drain(..).partition(|i| i.since.elapsed() > timeout);
            *idle = keep;
            old.into_iter().map(|i| i.client).collect()
        };
        let count = expired.len();
        for client in expired {
            self.shared.destroy(client, "expired");
        }
        count
    }

    /// Stop handing out clients and destroy every idle one. Clients still
    /// checked out are destroyed when released.
    pub fn shutdown(&self) {
        self.retire();
        self.shared.permits.close();
    }

    /// Like [`shutdown`](Self::shutdown) but callers already waiting still
    /// get their permit (used when a reconfigured pool replaces this one).
    pub fn retire(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let drained: Vec<Idle<M::Client>> = self.shared.idle.lock().drain(..).collect();
        for idle in drained {
            self.shared.destroy(idle.client, "shutdown");
        }
        self.shared.publish();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// RAII guard for a checked-out client.
pub struct PooledClient<M: Manager> {
    shared: Arc<Shared<M>>,
    client: Option<M::Client>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl<M: Manager> PooledClient<M> {
    fn new(shared: Arc<Shared<M>>, client: M::Client, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self { shared, client: Some(client), permit, broken: false }
    }

    /// Destroy this client on release instead of returning it.
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl<M: Manager> std::fmt::Debug for PooledClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("permit", &self.permit.is_some())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<M: Manager> Deref for PooledClient<M> {
    type Target = M::Client;

    fn deref(&self) -> &Self::Target {
        // Present until drop.
        self.client.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<M: Manager> DerefMut for PooledClient<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<M: Manager> Drop for PooledClient<M> {
    fn drop(&mut self) {
        let shared = &self.shared;
        if let Some(mut client) = self.client.take() {
            let opts = *shared.options.lock();
            let over_max = opts.max > 0 && shared.live.load(Ordering::Acquire) > opts.max;
            if self.broken {
                shared.destroy(client, "broken");
            } else if shared.closed.load(Ordering::Acquire) {
                shared.destroy(client, "shutdown");
            } else if over_max {
                shared.destroy(client, "shrunk");
            } else if !shared.manager.reset(&mut client) {
                shared.destroy(client, "reset_failed");
            } else {
                shared.idle.lock().push_back(Idle { client, since: Instant::now() });
            }
        }
        if let Some(permit) = self.permit.take() {
            shared.release_permit(permit);
        }
        shared.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Counter {
        created: AtomicU32,
        destroyed: AtomicU32,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl Manager for Arc<Counter> {
        type Client = u32;

        async fn create(&self) -> Result<u32> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(DbError::connect("test", "refused"));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn reset(&self, client: &mut u32) -> bool {
            *client != 99
        }

        fn destroy(&self, _client: u32) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max: usize, max_queue: usize) -> (ClientPool<Arc<Counter>>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let opts = PoolOptions {
            max,
            max_queue,
            acquire_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(60),
        };
        (ClientPool::new("test", counter.clone(), opts), counter)
    }

    #[tokio::test]
    async fn test_released_client_is_reused() {
        let (pool, counter) = pool(2, 10);
        let first = *pool.acquire().await.unwrap();
        let second = *pool.acquire().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats(), CoreStats { live: 1, idle: 1, waiting: 0 });
    }

    #[tokio::test]
    async fn test_never_exceeds_max_and_fails_fast_when_queue_full() {
        let (pool, _) = pool(1, 0);
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::QueueFull { .. }));
        assert_eq!(pool.stats().live, 1);
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_queued_caller_gets_released_client() {
        let (pool, counter) = pool(1, 1);
        let held = pool.acquire().await.unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire().await.map(|c| *c) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().waiting, 1);
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let (pool, _) = pool(1, 5);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::AcquireTimeout { .. }));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_unbounded_pool_creates_freely() {
        let (pool, counter) = pool(0, 0);
        let clients: Vec<_> = acquire_many(&pool, 20).await;
        assert_eq!(clients.len(), 20);
        assert_eq!(counter.created.load(Ordering::SeqCst), 20);
    }

    async fn acquire_many(pool: &ClientPool<Arc<Counter>>, n: usize) -> Vec<PooledClient<Arc<Counter>>> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(pool.acquire().await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_broken_and_unresettable_clients_are_destroyed() {
        let (pool, counter) = pool(2, 2);
        let mut c = pool.acquire().await.unwrap();
        c.discard();
        drop(c);
        assert_eq!(counter.destroyed.load(Ordering::SeqCst), 1);

        let mut c = pool.acquire().await.unwrap();
        *c = 99;
        drop(c);
        assert_eq!(counter.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats(), CoreStats::default());
    }

    #[tokio::test]
    async fn test_failed_create_releases_slot() {
        let (pool, counter) = pool(1, 0);
        counter.fail_next.store(true, Ordering::SeqCst);
        assert!(matches!(pool.acquire().await, Err(DbError::Connect { .. })));
        assert_eq!(pool.stats().live, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_shrink_applies_on_release() {
        let (pool, _) = pool(2, 0);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.resize(PoolOptions { max: 1, ..pool.options() });
        drop(a);
        assert_eq!(pool.stats().live, 1);
        assert!(matches!(pool.acquire().await, Err(DbError::QueueFull { .. })));
        drop(b);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_prefill_and_shutdown() {
        let (pool, counter) = pool(5, 0);
        assert_eq!(pool.prefill(3).await.unwrap(), 3);
        assert_eq!(pool.stats().idle, 3);
        pool.shutdown();
        assert_eq!(counter.destroyed.load(Ordering::SeqCst), 3);
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn test_prefill_opens_new_clients_beside_idle_ones() {
        let (pool, counter) = pool(3, 0);
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        assert_eq!(pool.prefill(3).await.unwrap(), 2);
        assert_eq!(counter.created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats(), CoreStats { live: 3, idle: 3, waiting: 0 });

        // Already at `max`.
        assert_eq!(pool.prefill(5).await.unwrap(), 0);
        assert_eq!(pool.stats().live, 3);
    }

    #[tokio::test]
    async fn test_idle_expiry() {
        let counter = Arc::new(Counter::default());
        let opts = PoolOptions { idle_timeout: Duration::from_millis(5), ..PoolOptions::default() };
        let pool = ClientPool::new("test", counter.clone(), opts);
        drop(pool.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.expire_idle(), 1);
        assert_eq!(pool.stats().live, 0);
    }
}
