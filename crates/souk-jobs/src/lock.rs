//! Distributed lock manager.
//!
//! Locks are TTL-bounded keys in the shared store whose value is a random
//! owner token. Only the holder presenting the token can release or renew the
//! lock, and an expired lock is indistinguishable from an absent one.
//!
//! ```text
//! acquire ──► SET lock:{key} token NX PX ttl ──► held? ──no──► back off, retry until max_wait
//!                                                  │
//!                                                 yes
//!                                                  ▼
//!                         keep_alive: PEXPIRE-if-token every ttl/3
//!                                                  │
//! release ──► DEL-if-token ◄───────────────────────┘
//! ```

use crate::config::LockConfig;
use crate::error::JobResult;
use crate::keys::StoreKeys;
use crate::metrics::LockMetrics;
use crate::store::LockStore;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Proof of holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    /// Logical resource name, without the store prefix.
    pub key: String,
    /// Random value identifying this holder.
    pub owner_token: String,
    pub ttl: Duration,
    pub acquired_at: DateTime<Utc>,
}

/// Acquires, renews and releases named locks.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    keys: StoreKeys,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, keys: StoreKeys, config: LockConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl()
    }

    pub fn default_wait(&self) -> Duration {
        self.config.default_wait()
    }

    /// Acquires `key` for `ttl`, polling for up to `max_wait` while it is held.
    ///
    /// Returns `Ok(None)` if the lock is still held when the wait runs out and
    /// `LockStoreUnavailable` if the store cannot be reached. Callers must treat
    /// both as "not acquired".
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> JobResult<Option<LockLease>> {
        let store_key = self.keys.lock(key);
        let owner_token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + max_wait;
        let mut backoff_ms = self.config.retry_interval_ms.max(1);

        loop {
            if self
                .store
                .set_if_absent(&store_key, &owner_token, ttl)
                .await?
            {
                debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "lock acquired");
                return Ok(Some(LockLease {
                    key: key.to_string(),
                    owner_token,
                    ttl,
                    acquired_at: Utc::now(),
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key = %key, "lock held, giving up");
                LockMetrics::contention(key);
                return Ok(None);
            }

            // Create rng here to avoid holding non-Send type across await
            let jitter = rand::rng().random_range(0..backoff_ms / 2 + 1);
            let sleep = Duration::from_millis(backoff_ms + jitter).min(deadline - now);
            tokio::time::sleep(sleep).await;

            backoff_ms = (backoff_ms * 2).min(self.config.max_retry_interval_ms.max(1));
        }
    }

    /// Single acquisition attempt without waiting.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> JobResult<Option<LockLease>> {
        self.acquire(key, ttl, Duration::ZERO).await
    }

    /// Releases `key` if `owner_token` still holds it.
    ///
    /// Returns false for a mismatched token or an expired lock.
    pub async fn release(&self, key: &str, owner_token: &str) -> JobResult<bool> {
        let released = self
            .store
            .compare_and_delete(&self.keys.lock(key), owner_token)
            .await?;
        if !released {
            debug!(key = %key, "release skipped, token no longer holds the lock");
        }
        Ok(released)
    }

    /// Resets the TTL of `key` to `ttl` if `owner_token` still holds it.
    ///
    /// A false return means exclusivity is lost and the critical section must
    /// be abandoned.
    pub async fn renew(&self, key: &str, owner_token: &str, ttl: Duration) -> JobResult<bool> {
        self.store
            .compare_and_expire(&self.keys.lock(key), owner_token, ttl)
            .await
    }

    /// Renews `lease` every `ttl / 3` until the returned handle is dropped.
    ///
    /// If a renewal fails or the lock has been taken over, `on_lost` is
    /// cancelled, [`KeepAlive::lost`] resolves and renewal stops. Renewal also
    /// stops once `on_lost` is cancelled by someone else, which does not count
    /// as a loss.
    pub fn keep_alive(self: &Arc<Self>, lease: &LockLease, on_lost: CancellationToken) -> KeepAlive {
        let manager = Arc::clone(self);
        let key = lease.key.clone();
        let token = lease.owner_token.clone();
        let ttl = lease.ttl;
        let interval = (ttl / 3).max(Duration::from_millis(10));
        let lost = CancellationToken::new();
        let lost_signal = lost.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = on_lost.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match manager.renew(&key, &token, ttl).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        warn!(key = %key, "lock lost before renewal");
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "lock renewal failed");
                    }
                }
                lost_signal.cancel();
                on_lost.cancel();
                break;
            }
        });

        KeepAlive { task, lost }
    }

    /// Runs `f` while holding `key`.
    ///
    /// Returns `Ok(None)` without running `f` if the lock could not be
    /// acquired within `max_wait`.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
        f: F,
    ) -> JobResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let Some(lease) = self.acquire(key, ttl, max_wait).await? else {
            return Ok(None);
        };
        let output = f().await;
        if let Err(e) = self.release(&lease.key, &lease.owner_token).await {
            warn!(key = %key, error = %e, "failed to release lock");
        }
        Ok(Some(output))
    }
}

/// Background renewal of a lease. Dropping the handle stops renewal.
pub struct KeepAlive {
    task: JoinHandle<()>,
    lost: CancellationToken,
}

impl KeepAlive {
    /// Returns true once a renewal has failed.
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once a renewal has failed. Never resolves otherwise.
    pub async fn lost(&self) {
        self.lost.cancelled().await;
    }

    /// Stops renewal.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::store::MemoryLockStore;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager_with(store: Arc<MemoryLockStore>) -> Arc<LockManager> {
        let config = LockConfig {
            default_ttl_ms: 1_000,
            default_wait_ms: 0,
            retry_interval_ms: 5,
            max_retry_interval_ms: 20,
        };
        Arc::new(LockManager::new(store, StoreKeys::default(), config))
    }

    fn manager() -> Arc<LockManager> {
        manager_with(Arc::new(MemoryLockStore::new()))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = manager();
        let lease = locks
            .try_acquire("sku_42", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("lock should be free");
        assert_eq!(lease.key, "sku_42");

        assert!(locks
            .try_acquire("sku_42", Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        assert!(locks.release("sku_42", &lease.owner_token).await.unwrap());
        assert!(locks
            .try_acquire("sku_42", Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_false() {
        let locks = manager();
        let lease = locks
            .try_acquire("sku_42", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        assert!(!locks.release("sku_42", "not-the-owner").await.unwrap());
        assert!(locks.release("sku_42", &lease.owner_token).await.unwrap());
        // Double release after the fact is harmless.
        assert!(!locks.release("sku_42", &lease.owner_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_absent() {
        let locks = manager();
        let first = locks
            .try_acquire("sku_42", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = locks
            .try_acquire("sku_42", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("expired lock should be reacquirable");
        assert_ne!(first.owner_token, second.owner_token);
        assert!(!locks.release("sku_42", &first.owner_token).await.unwrap());
        assert!(!locks
            .renew("sku_42", &first.owner_token, Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let locks = manager();
        let lease = locks
            .try_acquire("sku_42", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire("sku_42", Duration::from_secs(5), Duration::from_secs(2))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.release("sku_42", &lease.owner_token).await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn test_acquire_gives_up_after_max_wait() {
        let locks = manager();
        let _held = locks
            .try_acquire("sku_42", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let started = Instant::now();
        let result = locks
            .acquire("sku_42", Duration::from_secs(5), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager_with(Arc::clone(&store));
        store.set_unavailable(true);

        let err = locks
            .acquire("sku_42", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LockStoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_keep_alive_extends_lease() {
        let locks = manager();
        let lease = locks
            .try_acquire("report", Duration::from_millis(60))
            .await
            .unwrap()
            .unwrap();
        let lost = CancellationToken::new();
        let keep_alive = locks.keep_alive(&lease, lost.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!keep_alive.is_lost());
        assert!(locks
            .try_acquire("report", Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());

        drop(keep_alive);
        assert!(locks.release("report", &lease.owner_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_keep_alive_signals_lost_lock() {
        let store = Arc::new(MemoryLockStore::new());
        let locks = manager_with(Arc::clone(&store));
        let lease = locks
            .try_acquire("report", Duration::from_millis(60))
            .await
            .unwrap()
            .unwrap();
        let lost = CancellationToken::new();
        let keep_alive = locks.keep_alive(&lease, lost.clone());

        // Someone else force-releases and takes the lock.
        store
            .compare_and_delete("souk:lock:report", &lease.owner_token)
            .await
            .unwrap();
        locks
            .try_acquire("report", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), lost.cancelled())
            .await
            .expect("loss should be signalled");
        assert!(keep_alive.is_lost());
        tokio::time::timeout(Duration::from_millis(100), keep_alive.lost())
            .await
            .expect("lost() resolves after a failed renewal");
    }

    #[tokio::test]
    async fn test_keep_alive_stopped_by_caller_is_not_lost() {
        let locks = manager();
        let lease = locks
            .try_acquire("report", Duration::from_millis(60))
            .await
            .unwrap()
            .unwrap();
        let shutdown = CancellationToken::new();
        let keep_alive = locks.keep_alive(&lease, shutdown.clone());

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!keep_alive.is_lost());
        assert!(tokio::time::timeout(Duration::from_millis(50), keep_alive.lost())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_with_lock() {
        let locks = manager();
        let value = locks
            .with_lock("sku_42", Duration::from_secs(1), Duration::ZERO, || async { 7 })
            .await
            .unwrap();
        assert_eq!(value, Some(7));
        // Released afterwards.
        assert!(locks
            .try_acquire("sku_42", Duration::from_secs(1))
            .await
            .unwrap()
            .is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_mutual_exclusion(workers in 2usize..16, key in "[a-z]{1,8}") {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let acquired = rt.block_on(async move {
                let locks = manager();
                let winners = Arc::new(AtomicUsize::new(0));
                let mut handles = Vec::new();
                for _ in 0..workers {
                    let locks = Arc::clone(&locks);
                    let winners = Arc::clone(&winners);
                    let key = key.clone();
                    handles.push(tokio::spawn(async move {
                        let lease = locks
                            .try_acquire(&key, Duration::from_secs(30))
                            .await
                            .unwrap();
                        if lease.is_some() {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
                winners.load(Ordering::SeqCst)
            });

            prop_assert_eq!(acquired, 1);
        }
    }
}
