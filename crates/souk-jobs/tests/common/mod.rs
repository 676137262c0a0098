//! Common test infrastructure for Redis integration tests.

use deadpool_redis::Pool;
use souk_jobs::config::RedisConfig;
use souk_jobs::redis::create_pool;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

/// Test Redis container wrapper.
///
/// Keeps the container alive for as long as the pool is in use.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    pool: Pool,
}

impl TestRedis {
    /// Starts a fresh Redis container and connects a pool to it.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{}", port),
            pool_size: 8,
            key_prefix: "souk-test".to_string(),
        };

        let pool = create_pool(&config)
            .await
            .expect("Failed to connect to Redis");

        Self {
            _container: container,
            pool,
        }
    }

    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}
