//! Integration tests for the ephemeral result cache.
//!
//! Run under paused tokio time so TTL expiry is deterministic.

use std::time::Duration;

use forage::cache::ResultCache;
use forage::key::CacheKey;
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn get_returns_a_live_value() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let key = CacheKey::from_raw("k1");

    cache.put(key.clone(), json!({"v": 1}));
    assert_eq!(cache.get(&key), Some(json!({"v": 1})));
}

#[tokio::test(start_paused = true)]
async fn entry_expires_after_its_ttl() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let key = CacheKey::from_raw("k1");

    cache.put_with_ttl(key.clone(), json!("result"), Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(cache.get(&key), Some(json!("result")));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cache.get(&key), None);

    // Lazy expiry dropped the entry on the way out
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn overwrite_resets_the_deadline() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let key = CacheKey::from_raw("k1");

    cache.put_with_ttl(key.clone(), json!("old"), Duration::from_secs(10));
    tokio::time::advance(Duration::from_secs(8)).await;

    // Last-writer-wins, fresh deadline
    cache.put_with_ttl(key.clone(), json!("new"), Duration::from_secs(10));
    tokio::time::advance(Duration::from_secs(5)).await;

    assert_eq!(cache.get(&key), Some(json!("new")));
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_only_expired_entries() {
    let cache = ResultCache::new(Duration::from_secs(60));

    cache.put_with_ttl(CacheKey::from_raw("short-1"), json!(1), Duration::from_secs(5));
    cache.put_with_ttl(CacheKey::from_raw("short-2"), json!(2), Duration::from_secs(5));
    cache.put_with_ttl(CacheKey::from_raw("long"), json!(3), Duration::from_secs(120));

    tokio::time::advance(Duration::from_secs(6)).await;

    assert_eq!(cache.sweep(), 2);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&CacheKey::from_raw("long")), Some(json!(3)));
}

#[tokio::test(start_paused = true)]
async fn spurious_miss_only_costs_a_recomputation() {
    use forage::config::EngineConfig;
    use forage::engine::Engine;
    use forage::model::*;
    use forage::worker::ExecutorRegistry;

    // TTL of 10s at the engine level
    let config: EngineConfig = toml::from_str("[cache]\nttl_secs = 10").unwrap();
    let engine = Engine::in_memory(ExecutorRegistry::empty(), config).unwrap();
    let key = CacheKey::from_raw("durable-result");

    // A completed task holds the authoritative result
    let now = chrono::Utc::now();
    let task = Task {
        id: TaskId::new(),
        kind: TaskKind::Process,
        class: PriorityClass::Processing,
        payload: json!({}),
        cache_key: Some(key.clone()),
        status: TaskStatus::Pending,
        attempt_count: 0,
        max_attempts: 3,
        created_at: now,
        updated_at: now,
        next_retry_at: None,
        outcome: None,
    };
    engine.store().insert_task(&task).unwrap();
    engine
        .store()
        .transition(task.id, TaskStatus::Pending, TaskStatus::InProgress)
        .unwrap();
    engine
        .store()
        .settle_success(
            task.id,
            &Outcome {
                success: true,
                data: Some(json!({"kept": true})),
                error: None,
                duration_ms: 1,
            },
        )
        .unwrap();

    // Warm the cache, then let the entry expire
    assert_eq!(engine.lookup_result(&key).unwrap(), Some(json!({"kept": true})));
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(engine.cache().get(&key), None);

    // The miss path recovers the result from the durable store
    assert_eq!(engine.lookup_result(&key).unwrap(), Some(json!({"kept": true})));
}
