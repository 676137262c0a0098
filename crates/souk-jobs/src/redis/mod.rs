//! Redis-backed stores.

mod job_store;
mod lock_store;
mod scripts;

pub use job_store::RedisJobStore;
pub use lock_store::RedisLockStore;

use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool and verify it with a PING.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!(max_size = config.pool_size, "Creating Redis connection pool");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Milliseconds for a PX/PEXPIRE argument. Redis rejects zero.
pub(crate) fn ttl_millis(ttl: std::time::Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
