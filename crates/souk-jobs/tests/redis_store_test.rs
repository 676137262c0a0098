//! Integration tests for the Redis lock and job stores.
//!
//! These tests run against a real Redis using testcontainers and need Docker:
//! `cargo test -p souk-jobs -- --ignored`.

mod common;

use chrono::Utc;
use common::TestRedis;
use serde_json::json;
use souk_jobs::config::{JobsConfig, LockConfig};
use souk_jobs::redis::{RedisJobStore, RedisLockStore};
use souk_jobs::store::{InsertOutcome, JobStore, LockStore, RetentionPolicy};
use souk_jobs::{
    Dispatcher, EnqueueOptions, IdempotencyGuard, JobId, JobRecord, JobState, LockManager,
    Priority, StoreKeys,
};
use std::sync::Arc;
use std::time::Duration;

fn keys() -> StoreKeys {
    StoreKeys::new("souk-test")
}

fn record(queue: &str, priority: Priority, dedupe: Option<&str>) -> JobRecord {
    let now = Utc::now();
    JobRecord {
        id: JobId::new(),
        queue: queue.to_string(),
        handler: "sync_stock".to_string(),
        payload: json!({ "sku": "sku_42" }),
        state: JobState::Waiting,
        priority,
        attempts: 0,
        max_attempts: 3,
        backoff: Default::default(),
        scheduled_at: now,
        resource_lock_key: None,
        dedupe_key: dedupe.map(str::to_string),
        idempotency_key: None,
        timeout_ms: None,
        created_at: now,
        started_at: None,
        finished_at: None,
        worker_id: None,
        last_error: None,
        result: None,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lock_store_primitives() {
    let redis = TestRedis::new().await;
    let store = RedisLockStore::new(redis.pool());

    assert!(store
        .set_if_absent("souk-test:lock:a", "t1", Duration::from_secs(5))
        .await
        .unwrap());
    assert!(!store
        .set_if_absent("souk-test:lock:a", "t2", Duration::from_secs(5))
        .await
        .unwrap());

    assert!(!store.compare_and_delete("souk-test:lock:a", "t2").await.unwrap());
    assert!(store
        .compare_and_expire("souk-test:lock:a", "t1", Duration::from_secs(10))
        .await
        .unwrap());
    assert!(store
        .compare_and_swap("souk-test:lock:a", "t1", "t1-done")
        .await
        .unwrap());
    assert_eq!(
        store.get("souk-test:lock:a").await.unwrap().as_deref(),
        Some("t1-done")
    );
    assert!(store
        .compare_and_delete("souk-test:lock:a", "t1-done")
        .await
        .unwrap());
    assert!(store.get("souk-test:lock:a").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lock_expires() {
    let redis = TestRedis::new().await;
    let locks = LockManager::new(
        Arc::new(RedisLockStore::new(redis.pool())),
        keys(),
        LockConfig::default(),
    );

    let first = locks
        .try_acquire("sku_42", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = locks
        .try_acquire("sku_42", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(second.is_some());
    assert!(!locks.release("sku_42", &first.owner_token).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_idempotency_against_redis() {
    let redis = TestRedis::new().await;
    let guard = IdempotencyGuard::new(
        Arc::new(RedisLockStore::new(redis.pool())),
        keys(),
        &Default::default(),
    );

    assert!(guard.try_begin("evt_123", Duration::from_secs(60)).await.unwrap());
    assert!(!guard.try_begin("evt_123", Duration::from_secs(60)).await.unwrap());
    assert!(guard.complete("evt_123", json!({ "charged": 100 })).await.unwrap());
    assert_eq!(
        guard.get_result("evt_123").await.unwrap(),
        Some(json!({ "charged": 100 }))
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_job_store_insert_claim_and_dedupe() {
    let redis = TestRedis::new().await;
    let store = RedisJobStore::new(redis.pool(), keys(), RetentionPolicy::default());

    let low = record("inventory", Priority::Low, None);
    let high = record("inventory", Priority::High, Some("sync:shop-1"));
    let dup = record("inventory", Priority::Normal, Some("sync:shop-1"));

    store.insert(&low).await.unwrap();
    assert_eq!(
        store.insert(&high).await.unwrap(),
        InsertOutcome::Inserted(high.id.clone())
    );
    assert_eq!(
        store.insert(&dup).await.unwrap(),
        InsertOutcome::Duplicate(high.id.clone())
    );

    let counts = store.counts("inventory", Utc::now()).await.unwrap();
    assert_eq!(counts.waiting, 2);

    let claimed = store
        .claim("inventory", "w-1", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, high.id);
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.worker_id.as_deref(), Some("w-1"));

    let mut done = claimed;
    done.state = JobState::Completed;
    done.finished_at = Some(Utc::now());
    store.update(&done).await.unwrap();

    // Terminal state releases the dedupe key.
    assert!(matches!(
        store.insert(&dup).await.unwrap(),
        InsertOutcome::Inserted(_)
    ));
    assert_eq!(store.known_queues().await.unwrap(), vec!["inventory"]);
}

async fn zcard(redis: &TestRedis, key: &str) -> u64 {
    let mut conn = redis.pool().get().await.unwrap();
    redis::cmd("ZCARD")
        .arg(key)
        .query_async(&mut *conn)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cancel_and_workers() {
    let redis = TestRedis::new().await;
    let store = RedisJobStore::new(redis.pool(), keys(), RetentionPolicy::default());

    let job = record("emails", Priority::Normal, None);
    store.insert(&job).await.unwrap();
    let cancelled = store.cancel("emails", &job.id).await.unwrap();
    assert_eq!(cancelled.id, job.id);
    assert!(store.get("emails", &job.id).await.unwrap().is_none());

    store
        .heartbeat("emails", "w-1", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(store.live_workers("emails", Utc::now()).await.unwrap(), 1);

    // Counting leaves expired entries alone; the next heartbeat prunes them.
    let workers_key = keys().workers("emails");
    store
        .heartbeat("emails", "w-expired", Duration::ZERO)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(store.live_workers("emails", Utc::now()).await.unwrap(), 1);
    assert_eq!(zcard(&redis, &workers_key).await, 2);
    store
        .heartbeat("emails", "w-1", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(zcard(&redis, &workers_key).await, 1);

    store.remove_worker("emails", "w-1").await.unwrap();
    assert_eq!(store.live_workers("emails", Utc::now()).await.unwrap(), 0);
    store.ping().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_dispatcher_end_to_end() {
    let redis = TestRedis::new().await;
    let lock_store = Arc::new(RedisLockStore::new(redis.pool()));
    let mut config = JobsConfig::default();
    config.dispatcher.poll_interval_ms = 10;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(RedisJobStore::new(
            redis.pool(),
            keys(),
            config.dispatcher.retention(),
        )),
        Arc::new(LockManager::new(lock_store.clone(), keys(), config.lock.clone())),
        Arc::new(IdempotencyGuard::new(lock_store, keys(), &config.idempotency)),
        config,
    ));
    dispatcher.register_fn("echo", |_ctx, payload| async move { Ok(payload) });

    let id = dispatcher
        .enqueue(
            "default",
            "echo",
            json!({ "n": 1 }),
            EnqueueOptions::new().resource_lock("echo"),
        )
        .await
        .unwrap();

    let runner = tokio::spawn(Arc::clone(&dispatcher).run());
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let job = loop {
        let job = dispatcher.job("default", &id).await.unwrap().unwrap();
        if job.state == JobState::Completed {
            break job;
        }
        assert!(std::time::Instant::now() < deadline, "job never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    dispatcher.stop();
    runner.await.unwrap().unwrap();

    assert_eq!(job.result, Some(json!({ "n": 1 })));
    assert_eq!(job.attempts, 1);
}
