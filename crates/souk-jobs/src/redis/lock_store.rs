//! Redis implementation of the lock store adapter.

use super::scripts;
use super::ttl_millis;
use crate::error::{JobError, JobResult};
use crate::store::LockStore;
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Script;
use std::time::Duration;

/// [`LockStore`] over `SET NX PX` and compare-and-* Lua scripts.
///
/// Every failure, including pool exhaustion, is reported as
/// `LockStoreUnavailable` so callers fail closed.
pub struct RedisLockStore {
    pool: Pool,
    compare_and_delete: Script,
    compare_and_expire: Script,
    compare_and_swap: Script,
}

impl RedisLockStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            compare_and_delete: Script::new(scripts::COMPARE_AND_DELETE),
            compare_and_expire: Script::new(scripts::COMPARE_AND_PEXPIRE),
            compare_and_swap: Script::new(scripts::COMPARE_AND_SWAP),
        }
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(JobError::lock_store)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(JobError::lock_store)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i32 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await
            .map_err(JobError::lock_store)?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let renewed: i32 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(JobError::lock_store)?;
        Ok(renewed == 1)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let swapped: i32 = self
            .compare_and_swap
            .key(key)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut *conn)
            .await
            .map_err(JobError::lock_store)?;
        Ok(swapped == 1)
    }

    async fn get(&self, key: &str) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(JobError::lock_store)
    }
}
