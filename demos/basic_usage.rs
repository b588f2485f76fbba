// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic polystore usage example.
//!
//! Demonstrates:
//! 1. Configuring an in-memory pool and an in-process Cassandra pool
//! 2. Writing rows and reading them back
//! 3. Paging a composite-key select
//! 4. Cached reads (miss, then local hit) and invalidation on update
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! Everything runs in-process; no servers are needed.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::collections::HashMap;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use polystore::{
    CacheConfig, ColumnType, Db, PoolConfig, QueryOptions, RegistryConfig, TableCacheConfig, TableSpec,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║              polystore: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring pools...");

    let users_cache = TableCacheConfig {
        local_ttl: Some(30_000),
        keys: HashMap::from([("email".to_string(), vec!["email".to_string()])]),
        ..TableCacheConfig::default()
    };
    let mut config = RegistryConfig {
        pools: vec![
            PoolConfig::new("default", "memory"),
            PoolConfig::new("events", "cassandra").with_url("memory://"),
        ],
        aliases: HashMap::from([("log".to_string(), "events".to_string())]),
        cache: CacheConfig {
            tables: HashMap::from([("users".to_string(), users_cache)]),
            ..CacheConfig::default()
        },
        ..RegistryConfig::default()
    };
    config.tables.insert(
        "users".into(),
        TableSpec::new()
            .primary("id", ColumnType::Text)
            .column("email", ColumnType::Text)
            .column("name", ColumnType::Text)
            .column("logins", ColumnType::Int),
    );
    config.tables.insert(
        "messages".into(),
        TableSpec::new()
            .primary("account_id", ColumnType::Text)
            .primary("mtime", ColumnType::Int)
            .column("body", ColumnType::Text),
    );

    let db = Db::connect(&config).await?;
    println!("   State: {}", db.registry().state());
    db.start().await?;
    println!("   ✅ Started! State: {}", db.registry().state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write and read rows
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing users...");
    let users = [
        ("u1", "alice@example.com", "Alice"),
        ("u2", "bob@example.com", "Bob"),
        ("u3", "carol@example.com", "Carol"),
    ];
    for (id, email, name) in users {
        db.add("users", json!({"id": id, "email": email, "name": name}), QueryOptions::default())
            .await?;
        println!("   └─ {id}: {name}");
    }

    let listed = db.list("users", json!({"id": ["u1", "u3"]}), QueryOptions::default()).await?;
    println!("\n📋 list(u1, u3) → {} rows", listed.rows.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Paged select on a composite key
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📜 Writing 25 messages to the 'log' alias...");
    let on_log = QueryOptions { pool: Some("log".into()), ..QueryOptions::default() };
    for mtime in 0..25 {
        db.add(
            "messages",
            json!({"account_id": "u1", "mtime": mtime, "body": format!("message {mtime}")}),
            on_log.clone(),
        )
        .await?;
    }
    let mut token = None;
    let mut page = 0;
    loop {
        page += 1;
        let options = QueryOptions { count: Some(10), start: token.clone(), ..on_log.clone() };
        let res = db.select("messages", json!({"account_id": "u1"}), options).await?;
        println!("   └─ page {page}: {} rows, more: {}", res.rows.len(), res.info.next_token.is_some());
        token = res.info.next_token;
        if token.is_none() {
            break;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Cached reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚡ Cached reads:");
    for attempt in 1..=2 {
        let res = db.get("users", json!({"id": "u2"}), QueryOptions::default()).await?;
        println!("   └─ get u2 #{attempt}: cached={}", res.info.cached);
    }
    let by_email = QueryOptions { cache_key_name: Some("email".into()), ..QueryOptions::default() };
    for attempt in 1..=2 {
        let res = db.get("users", json!({"email": "carol@example.com"}), by_email.clone()).await?;
        let name = res.first().and_then(|r| r.get("name")).cloned().unwrap_or_default();
        println!("   └─ get by email #{attempt}: {name} cached={}", res.info.cached);
    }

    db.update("users", json!({"id": "u2", "name": "Robert"}), QueryOptions::default()).await?;
    db.incr("users", json!({"id": "u2", "logins": 1}), QueryOptions::default()).await?;
    let res = db.get("users", json!({"id": "u2"}), QueryOptions::default()).await?;
    println!("   └─ after update: {:?} cached={}", res.first(), res.info.cached);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Stats and metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Pool stats:");
    for stats in db.stats() {
        println!(
            "   └─ {} ({}): live={} idle={} requests={} errors={} cache hits={} misses={}",
            stats.name, stats.kind, stats.live, stats.idle, stats.requests, stats.errors, stats.cache_hits, stats.cache_misses
        );
    }

    println!("\n📈 Raw metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    db.shutdown();
    println!("   ✅ Shutdown complete! State: {}", db.registry().state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = vec![];
    let mut gauges = vec![];
    let mut histograms = vec![];

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = format!("{}{}", key.name(), label_str);

        match value {
            DebugValue::Counter(v) => counters.push((name, v)),
            DebugValue::Gauge(v) => gauges.push((name, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(0.0, f64::max);
                histograms.push((name, count, sum, max));
            }
        }
    }
    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, value) in &counters {
            println!("   │  └─ {name} = {value}");
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, value) in &gauges {
            println!("   │  └─ {name} = {value:.2}");
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, count, sum, max) in &histograms {
            println!("      └─ {name} count={count} sum={sum:.4} max={max:.4}");
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
