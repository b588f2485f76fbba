// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for polystore.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `polystore_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `pool`: configured pool name
//! - `op`: get, select, add, put, update, incr, del, list, ...
//! - `tier`: local, shared
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a finished request
pub fn record_request(pool: &str, op: &str, status: &str) {
    counter!(
        "polystore_requests_total",
        "pool" => pool.to_string(),
        "op" => op.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record request latency
pub fn record_latency(pool: &str, op: &str, duration: Duration) {
    histogram!(
        "polystore_request_seconds",
        "pool" => pool.to_string(),
        "op" => op.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record rows returned by a read
pub fn record_rows(pool: &str, op: &str, count: usize) {
    histogram!(
        "polystore_rows_returned",
        "pool" => pool.to_string(),
        "op" => op.to_string()
    )
    .record(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// POOL - Client lifecycle and queueing
// ═══════════════════════════════════════════════════════════════════════════

/// Callers waiting for a client when an acquire started
pub fn record_queue_depth(pool: &str, waiting: usize) {
    histogram!(
        "polystore_pool_queue_depth",
        "pool" => pool.to_string()
    )
    .record(waiting as f64);
}

/// Time spent waiting for a client
pub fn record_acquire_wait(pool: &str, duration: Duration) {
    histogram!(
        "polystore_pool_acquire_seconds",
        "pool" => pool.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_pool_clients(pool: &str, live: usize, idle: usize) {
    gauge!("polystore_pool_live_clients", "pool" => pool.to_string()).set(live as f64);
    gauge!("polystore_pool_idle_clients", "pool" => pool.to_string()).set(idle as f64);
}

/// Record a client lifecycle event (created, destroyed, expired, reset_failed)
pub fn record_client_event(pool: &str, event: &str) {
    counter!(
        "polystore_pool_clients_total",
        "pool" => pool.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record a retried native connect
pub fn record_create_retry(pool: &str) {
    counter!(
        "polystore_pool_create_retries_total",
        "pool" => pool.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with its class (see `DbError::class`)
pub fn record_error(pool: &str, op: &str, error_type: &str) {
    counter!(
        "polystore_errors_total",
        "pool" => pool.to_string(),
        "op" => op.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Hit/miss per tier
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_cache_hit(table: &str, tier: &str) {
    counter!(
        "polystore_cache_hits_total",
        "table" => table.to_string(),
        "tier" => tier.to_string()
    )
    .increment(1);
}

pub fn record_cache_miss(table: &str) {
    counter!(
        "polystore_cache_misses_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Record a cache tier failure that was treated as a miss
pub fn record_cache_error(tier: &str) {
    counter!(
        "polystore_cache_errors_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

pub fn record_cache_invalidation(table: &str, keys: usize) {
    counter!(
        "polystore_cache_invalidations_total",
        "table" => table.to_string()
    )
    .increment(keys as u64);
}

pub fn set_local_cache_entries(count: usize) {
    gauge!("polystore_cache_local_entries").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "polystore_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "polystore_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a startup phase duration (prefill, cache_columns, init_tables)
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "polystore_startup_phase_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_pool_count(count: usize) {
    gauge!("polystore_pools").set(count as f64);
}

/// A timing guard that records request latency on drop
pub struct LatencyTimer {
    pool: String,
    op: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(pool: &str, op: &'static str) -> Self {
        Self {
            pool: pool.to_string(),
            op,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(&self.pool, self.op, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($pool:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($pool, $op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_request_metrics_do_not_panic() {
        record_request("main", "get", "success");
        record_request("main", "select", "error");
        record_latency("main", "get", Duration::from_micros(100));
        record_rows("main", "select", 25);
        record_error("main", "add", "exists");
    }

    #[test]
    fn test_pool_metrics_do_not_panic() {
        record_queue_depth("main", 3);
        record_acquire_wait("main", Duration::from_millis(2));
        set_pool_clients("main", 4, 1);
        record_client_event("main", "created");
        record_create_retry("main");
    }

    #[test]
    fn test_cache_hits_are_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_cache_hit("users", "local");
            record_cache_hit("users", "local");
            record_cache_miss("users");
        });

        let hits: u64 = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, ..)| key.key().name() == "polystore_cache_hits_total")
            .map(|(.., value)| match value {
                DebugValue::Counter(n) => n,
                _ => 0,
            })
            .sum();
        assert_eq!(hits, 2);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = time_operation!("main", "get");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
