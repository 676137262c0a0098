//! Component wiring.
//!
//! Builds the coordination core from configuration: one Redis pool shared by
//! the lock and job stores, the Lock Manager and Idempotency Guard on top of
//! the lock store, then the Dispatcher, Health Monitor and Scheduler.

use souk_core::SoukResult;
use souk_jobs::redis::{create_pool, RedisJobStore, RedisLockStore};
use souk_jobs::{
    AlertSink, Dispatcher, HealthMonitor, IdempotencyGuard, JobStore, JobsConfig, LockManager,
    LockStore, QueueHealthInterface, QueueHealthService, Scheduler, StoreKeys, TracingAlertSink,
};
use std::sync::Arc;
use tracing::info;

/// Every long-lived component of a worker process.
#[derive(Clone)]
pub struct AppComponents {
    pub dispatcher: Arc<Dispatcher>,
    pub monitor: Arc<HealthMonitor>,
    /// `None` when the scheduler is disabled.
    pub scheduler: Option<Arc<Scheduler>>,
    pub queue_health: Arc<dyn QueueHealthInterface>,
}

/// Connects to Redis and builds the components on top of it.
pub async fn build_redis_components(config: &JobsConfig) -> SoukResult<AppComponents> {
    let pool = create_pool(&config.redis).await?;
    let keys = StoreKeys::new(&config.redis.key_prefix);

    let lock_store: Arc<dyn LockStore> = Arc::new(RedisLockStore::new(pool.clone()));
    let job_store: Arc<dyn JobStore> = Arc::new(RedisJobStore::new(
        pool,
        keys,
        config.dispatcher.retention(),
    ));

    build_components(lock_store, job_store, Arc::new(TracingAlertSink), config)
}

/// Builds the components over the given stores.
pub fn build_components(
    lock_store: Arc<dyn LockStore>,
    job_store: Arc<dyn JobStore>,
    alert_sink: Arc<dyn AlertSink>,
    config: &JobsConfig,
) -> SoukResult<AppComponents> {
    let keys = StoreKeys::new(&config.redis.key_prefix);

    let locks = Arc::new(LockManager::new(
        lock_store.clone(),
        keys.clone(),
        config.lock.clone(),
    ));
    let idempotency = Arc::new(IdempotencyGuard::new(
        lock_store,
        keys.clone(),
        &config.idempotency,
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        job_store.clone(),
        locks.clone(),
        idempotency,
        config.clone(),
    ));

    let monitor = Arc::new(HealthMonitor::new(
        job_store,
        alert_sink,
        config.health.clone(),
        dispatcher.queues(),
    ));

    let scheduler = if config.scheduler.enabled {
        let scheduler = Scheduler::from_config(
            dispatcher.clone(),
            locks,
            &keys,
            config.scheduler.clone(),
        )?;
        Some(Arc::new(scheduler))
    } else {
        None
    };

    let queue_health: Arc<dyn QueueHealthInterface> =
        Arc::new(QueueHealthService::new(monitor.clone()));

    info!(
        queues = ?dispatcher.queues(),
        scheduled_jobs = config.scheduler.jobs.len(),
        "Components built"
    );

    Ok(AppComponents {
        dispatcher,
        monitor,
        scheduler,
        queue_health,
    })
}
