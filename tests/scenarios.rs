// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end scenarios through `Db`, using the in-process backends.
//!
//! Run with: `cargo test --test scenarios`

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use polystore::cache::{LOCAL_HIT, MISS, SHARED_HIT};
use polystore::{
    CacheConfig, CacheLayer, ColumnType, Db, DbError, PoolConfig, QueryOptions, Registry, RegistryConfig,
    SharedCache, TableCacheConfig, TableSpec,
};

// =============================================================================
// Helpers
// =============================================================================

fn messages_spec() -> TableSpec {
    TableSpec::new()
        .primary("account_id", ColumnType::Text)
        .primary("mtime", ColumnType::Int)
        .column("status", ColumnType::Text)
}

fn single_pool(kind: &str, url: &str) -> RegistryConfig {
    let mut pool = PoolConfig::new("default", kind).with_url(url);
    pool.max = 0;
    let mut cfg = RegistryConfig { pools: vec![pool], ..RegistryConfig::default() };
    cfg.tables.insert("messages".into(), messages_spec());
    cfg
}

async fn started(cfg: &RegistryConfig) -> Db {
    let db = Db::connect(cfg).await.expect("connect");
    db.start().await.expect("start");
    db
}

fn opts() -> QueryOptions {
    QueryOptions::default()
}

/// Shared tier double standing in for Redis; `down` fails every call.
#[derive(Default)]
struct FakeShared {
    entries: DashMap<String, String>,
    down: AtomicBool,
}

#[async_trait]
impl SharedCache for FakeShared {
    async fn get(&self, key: &str) -> polystore::Result<Option<String>> {
        if self.down.load(Ordering::Relaxed) {
            return Err(DbError::Cache("connection refused".into()));
        }
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> polystore::Result<()> {
        if self.down.load(Ordering::Relaxed) {
            return Err(DbError::Cache("connection refused".into()));
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> polystore::Result<()> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }
}

fn cached_users() -> RegistryConfig {
    let users = TableCacheConfig {
        ttl: Some(60_000),
        local_ttl: Some(10_000),
        ..TableCacheConfig::default()
    };
    let mut cfg = RegistryConfig {
        pools: vec![PoolConfig::new("default", "memory")],
        cache: CacheConfig { tables: HashMap::from([("users".to_string(), users)]), ..CacheConfig::default() },
        ..RegistryConfig::default()
    };
    cfg.tables.insert(
        "users".into(),
        TableSpec::new().primary("id", ColumnType::Text).column("name", ColumnType::Text),
    );
    cfg
}

/// A `Db` over `registry` with its own local tier and the given shared tier.
fn process(cfg: &RegistryConfig, registry: Arc<Registry>, shared: Arc<FakeShared>) -> Db {
    let cache = CacheLayer::with_shared(cfg.cache.clone(), shared);
    Db::with_parts(registry, Arc::new(cache))
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_unbounded_memory_pool_round_trip() {
    let db = started(&single_pool("memory", "")).await;
    db.add("users", json!({"id": "1", "name": "a"}), opts()).await.unwrap();

    let res = db.get("users", json!({"id": "1"}), opts()).await.unwrap();
    assert_eq!(res.rows.len(), 1);
    assert_eq!(Value::Object(res.rows[0].clone()), json!({"id": "1", "name": "a"}));
    db.shutdown();
}

#[tokio::test]
async fn scenario_redis_add_conflicts_and_put_overwrites() {
    let db = started(&single_pool("redis", "memory://")).await;
    let row = json!({"account_id": "a", "mtime": 1, "status": "new"});
    db.add("messages", row.clone(), opts()).await.unwrap();

    let dup = db.add("messages", row, opts()).await;
    assert!(matches!(dup, Err(DbError::AlreadyExists { .. })));

    db.put("messages", json!({"account_id": "a", "mtime": 1, "status": "replaced"}), opts())
        .await
        .unwrap();
    let res = db.get("messages", json!({"account_id": "a", "mtime": 1}), opts()).await.unwrap();
    assert_eq!(res.rows[0]["status"], json!("replaced"));
}

#[tokio::test]
async fn scenario_cassandra_pages_cover_every_row() {
    let db = started(&single_pool("cassandra", "memory://")).await;
    for mtime in 0..25 {
        db.add("messages", json!({"account_id": "acct", "mtime": mtime, "status": "ok"}), opts())
            .await
            .unwrap();
    }

    let mut seen = HashSet::new();
    let mut token = None;
    for call in 0..3 {
        let page = QueryOptions { count: Some(10), start: token.clone(), ..opts() };
        let res = db.select("messages", json!({"account_id": "acct"}), page).await.unwrap();
        for row in &res.rows {
            seen.insert(row["mtime"].as_i64().unwrap());
        }
        token = res.info.next_token;
        if call < 2 {
            assert!(token.is_some(), "page {call} should carry a token");
        }
    }
    assert_eq!(seen.len(), 25);
    assert!(token.is_none());
}

#[tokio::test]
async fn scenario_every_kind_agrees_on_basic_crud() {
    for (kind, url) in [
        ("memory", ""),
        ("redis", "memory://"),
        ("cassandra", "memory://"),
        ("mongodb", "memory://"),
        ("couchdb", "memory://"),
        ("riak", "memory://"),
    ] {
        let db = started(&single_pool(kind, url)).await;
        let key = json!({"account_id": "a", "mtime": 7});
        db.add("messages", json!({"account_id": "a", "mtime": 7, "status": "new"}), opts())
            .await
            .unwrap();

        let res = db.update("messages", json!({"account_id": "a", "mtime": 7, "status": "read"}), opts())
            .await
            .unwrap();
        assert_eq!(res.affected_rows(), 1, "{kind} update");
        let res = db.get("messages", key.clone(), opts()).await.unwrap();
        assert_eq!(res.rows[0]["status"], json!("read"), "{kind} get");

        let res = db.del("messages", key.clone(), opts()).await.unwrap();
        assert_eq!(res.affected_rows(), 1, "{kind} del");
        let res = db.get("messages", key, opts()).await.unwrap();
        assert!(res.rows.is_empty(), "{kind} get after del");
        db.shutdown();
    }
}

#[tokio::test]
async fn scenario_must_exist_and_list() {
    let db = started(&single_pool("memory", "")).await;
    for id in ["1", "2", "3"] {
        db.add("users", json!({"id": id, "name": format!("user {id}")}), opts()).await.unwrap();
    }

    let strict = QueryOptions { must_exist: true, ..opts() };
    let missing = db.update("users", json!({"id": "9", "name": "x"}), strict).await;
    assert!(matches!(missing, Err(DbError::InvalidId { .. })));

    let res = db.list("users", json!({"id": ["1", "3", "9"]}), opts()).await.unwrap();
    let mut ids: Vec<&str> = res.rows.iter().filter_map(|r| r["id"].as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["1", "3"]);
}

// =============================================================================
// Cache consistency
// =============================================================================

#[tokio::test]
async fn cache_update_is_never_served_stale() {
    let cfg = cached_users();
    let registry = Arc::new(Registry::new(&cfg).unwrap());
    registry.start().await.unwrap();
    let shared = Arc::new(FakeShared::default());
    let db = process(&cfg, Arc::clone(&registry), Arc::clone(&shared));

    db.add("users", json!({"id": "u1", "name": "ann"}), opts()).await.unwrap();
    for round in 0..5 {
        let name = format!("name {round}");
        let first = db.get("users", json!({"id": "u1"}), opts()).await.unwrap();
        let second = db.get("users", json!({"id": "u1"}), opts()).await.unwrap();
        assert_eq!(second.info.cached, LOCAL_HIT);
        assert_eq!(first.rows[0]["name"], second.rows[0]["name"]);

        db.update("users", json!({"id": "u1", "name": name}), opts()).await.unwrap();
        let after = db.get("users", json!({"id": "u1"}), opts()).await.unwrap();
        assert_eq!(after.info.cached, MISS);
        assert_eq!(after.rows[0]["name"], json!(name));
    }
}

#[tokio::test]
async fn cache_shared_tier_serves_other_processes() {
    let cfg = cached_users();
    let registry = Arc::new(Registry::new(&cfg).unwrap());
    registry.start().await.unwrap();
    let shared = Arc::new(FakeShared::default());
    let writer = process(&cfg, Arc::clone(&registry), Arc::clone(&shared));
    let reader = process(&cfg, Arc::clone(&registry), Arc::clone(&shared));

    writer.add("users", json!({"id": "u2", "name": "bo"}), opts()).await.unwrap();
    let miss = writer.get("users", json!({"id": "u2"}), opts()).await.unwrap();
    assert_eq!(miss.info.cached, MISS);

    let hit = reader.get("users", json!({"id": "u2"}), opts()).await.unwrap();
    assert_eq!(hit.info.cached, SHARED_HIT);
    assert_eq!(hit.rows[0]["name"], json!("bo"));

    writer.del("users", json!({"id": "u2"}), opts()).await.unwrap();
    assert!(shared.entries.get("users:u2").is_none());
}

#[tokio::test]
async fn cache_outage_falls_back_to_the_backend() {
    let cfg = cached_users();
    let registry = Arc::new(Registry::new(&cfg).unwrap());
    registry.start().await.unwrap();
    let shared = Arc::new(FakeShared::default());
    shared.down.store(true, Ordering::Relaxed);
    let db = process(&cfg, registry, Arc::clone(&shared));

    db.add("users", json!({"id": "u3", "name": "cy"}), opts()).await.unwrap();
    let local_only = QueryOptions { cache_ttl: Some(-5_000), ..opts() };
    for _ in 0..10 {
        let res = db.get("users", json!({"id": "u3"}), opts()).await.unwrap();
        assert_eq!(res.rows[0]["name"], json!("cy"));
    }
    let res = db.get("users", json!({"id": "u3"}), local_only).await.unwrap();
    assert_eq!(res.rows[0]["name"], json!("cy"));
    assert!(db.cache().breaker().failures() > 0);
}

/// `users` cached with a secondary key on `email`.
fn cached_users_by_email() -> RegistryConfig {
    let mut cfg = cached_users();
    if let Some(users) = cfg.cache.tables.get_mut("users") {
        users.keys.insert("email".into(), vec!["email".into()]);
    }
    cfg.tables.insert(
        "users".into(),
        TableSpec::new()
            .primary("id", ColumnType::Text)
            .column("email", ColumnType::Text)
            .column("name", ColumnType::Text),
    );
    cfg
}

#[tokio::test]
async fn cache_secondary_key_follows_updates_and_deletes() {
    let cfg = cached_users_by_email();
    let registry = Arc::new(Registry::new(&cfg).unwrap());
    registry.start().await.unwrap();
    let db = process(&cfg, registry, Arc::new(FakeShared::default()));
    let by_email = QueryOptions { cache_key_name: Some("email".into()), ..opts() };

    db.add("users", json!({"id": "u1", "email": "a@x", "name": "ann"}), opts()).await.unwrap();
    let first = db.get("users", json!({"email": "a@x"}), by_email.clone()).await.unwrap();
    assert_eq!(first.rows[0]["id"], json!("u1"));
    let again = db.get("users", json!({"email": "a@x"}), by_email.clone()).await.unwrap();
    assert_eq!(again.info.cached, LOCAL_HIT);

    db.update("users", json!({"id": "u1", "email": "b@x"}), opts()).await.unwrap();
    let stale = db.get("users", json!({"email": "a@x"}), by_email.clone()).await.unwrap();
    assert!(stale.rows.is_empty(), "old email still resolves: {:?}", stale.rows);
    let moved = db.get("users", json!({"email": "b@x"}), by_email.clone()).await.unwrap();
    assert_eq!(moved.rows[0]["id"], json!("u1"));
    assert_eq!(moved.rows[0]["name"], json!("ann"));

    db.del("users", json!({"id": "u1"}), opts()).await.unwrap();
    let gone = db.get("users", json!({"email": "b@x"}), by_email).await.unwrap();
    assert!(gone.rows.is_empty());
}

#[tokio::test]
async fn cache_secondary_key_without_cached_record() {
    let cfg = cached_users_by_email();
    let registry = Arc::new(Registry::new(&cfg).unwrap());
    registry.start().await.unwrap();
    let db = process(&cfg, registry, Arc::new(FakeShared::default()));
    let by_email = QueryOptions { cache_key_name: Some("email".into()), ..opts() };

    // `add` leaves only the pointer behind, so the update has no old copy
    // to read the previous email from.
    db.add("users", json!({"id": "u2", "email": "c@x"}), opts()).await.unwrap();
    db.update("users", json!({"id": "u2", "email": "d@x"}), opts()).await.unwrap();
    let fresh = db.get("users", json!({"id": "u2"}), opts()).await.unwrap();
    assert_eq!(fresh.rows[0]["email"], json!("d@x"));

    let stale = db.get("users", json!({"email": "c@x"}), by_email.clone()).await.unwrap();
    assert!(stale.rows.is_empty(), "old email still resolves: {:?}", stale.rows);
    assert_eq!(stale.info.cached, MISS);
}
