//! In-process stores for tests and single-process development.
//!
//! Each store guards its whole state with one mutex, which gives every
//! operation the same atomicity the Redis scripts provide.

use super::{InsertOutcome, JobStore, LockStore, RetentionPolicy, StateCounts};
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory [`LockStore`] with TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every operation fails with `LockStoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> JobResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(JobError::lock_store("memory store marked unavailable"));
        }
        Ok(())
    }

    /// Runs `f` on the live entry for `key`, dropping it first if expired.
    fn with_live<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock();
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            entries.remove(key);
        }
        f(&mut entries)
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> JobResult<bool> {
        self.check()?;
        Ok(self.with_live(key, |entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
            true
        }))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> JobResult<bool> {
        self.check()?;
        Ok(self.with_live(key, |entries| {
            if entries.get(key).is_some_and(|entry| entry.value == expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> JobResult<bool> {
        self.check()?;
        Ok(self.with_live(key, |entries| match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }))
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> JobResult<bool> {
        self.check()?;
        Ok(self.with_live(key, |entries| match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.value = value.to_string();
                true
            }
            _ => false,
        }))
    }

    async fn get(&self, key: &str) -> JobResult<Option<String>> {
        self.check()?;
        Ok(self.with_live(key, |entries| entries.get(key).map(|entry| entry.value.clone())))
    }
}

#[derive(Debug)]
struct StoredJob {
    record: JobRecord,
    seq: u64,
}

impl StoredJob {
    fn index_time(&self) -> DateTime<Utc> {
        self.record.index_time()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, StoredJob>,
    dedupe: HashMap<String, JobId>,
    workers: HashMap<String, DateTime<Utc>>,
}

impl QueueState {
    fn release_dedupe(&mut self, record: &JobRecord) {
        if let Some(key) = &record.dedupe_key {
            if self.dedupe.get(key) == Some(&record.id) {
                self.dedupe.remove(key);
            }
        }
    }

    fn trim(&mut self, state: JobState, keep: usize) {
        let mut terminal: Vec<(DateTime<Utc>, u64, JobId)> = self
            .jobs
            .values()
            .filter(|job| job.record.state == state)
            .map(|job| (job.index_time(), job.seq, job.record.id.clone()))
            .collect();

        if terminal.len() <= keep {
            return;
        }

        terminal.sort();
        let excess = terminal.len() - keep;
        for (_, _, id) in terminal.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<String, QueueState>,
    seq: u64,
}

/// In-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    retention: RetentionPolicy,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            state: Mutex::default(),
            retention,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> JobResult<InsertOutcome> {
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        let queue = state.queues.entry(job.queue.clone()).or_default();

        if let Some(existing) = queue.jobs.get(&job.id) {
            if !existing.record.state.is_terminal() {
                return Ok(InsertOutcome::Duplicate(job.id.clone()));
            }
        }

        if let Some(key) = &job.dedupe_key {
            if let Some(owner) = queue.dedupe.get(key) {
                let live = queue
                    .jobs
                    .get(owner)
                    .is_some_and(|stored| !stored.record.state.is_terminal());
                if live {
                    return Ok(InsertOutcome::Duplicate(owner.clone()));
                }
            }
            queue.dedupe.insert(key.clone(), job.id.clone());
        }

        queue.jobs.insert(
            job.id.clone(),
            StoredJob {
                record: job.clone(),
                seq,
            },
        );

        Ok(InsertOutcome::Inserted(job.id.clone()))
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>> {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(queue) else {
            return Ok(None);
        };

        let next = queue
            .jobs
            .values()
            .filter(|job| job.record.state.is_pending() && job.record.scheduled_at <= now)
            .min_by_key(|job| {
                (
                    Reverse(job.record.priority),
                    job.record.scheduled_at,
                    job.seq,
                )
            })
            .map(|job| job.record.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };

        let Some(job) = queue.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.record.state = JobState::Active;
        job.record.started_at = Some(now);
        job.record.worker_id = Some(worker_id.to_string());

        Ok(Some(job.record.clone()))
    }

    async fn update(&self, job: &JobRecord) -> JobResult<()> {
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        let queue = state.queues.entry(job.queue.clone()).or_default();

        let seq = queue.jobs.get(&job.id).map_or(seq, |stored| stored.seq);
        queue.jobs.insert(
            job.id.clone(),
            StoredJob {
                record: job.clone(),
                seq,
            },
        );

        if job.state.is_terminal() {
            queue.release_dedupe(job);
        }
        if let Some(keep) = self.retention.limit_for(job.state) {
            queue.trim(job.state, keep);
        }

        Ok(())
    }

    async fn get(&self, queue: &str, id: &JobId) -> JobResult<Option<JobRecord>> {
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .and_then(|q| q.jobs.get(id))
            .map(|job| job.record.clone()))
    }

    async fn cancel(&self, queue: &str, id: &JobId) -> JobResult<JobRecord> {
        let mut state = self.state.lock();
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        let current = queue
            .jobs
            .get(id)
            .map(|job| job.record.state)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if !current.is_pending() {
            return Err(JobError::InvalidState {
                expected: "waiting or delayed".to_string(),
                actual: current.to_string(),
            });
        }

        let removed = queue
            .jobs
            .remove(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        queue.release_dedupe(&removed.record);

        Ok(removed.record)
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let now = Utc::now();
        let guard = self.state.lock();
        let Some(queue) = guard.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut jobs: Vec<&StoredJob> = queue
            .jobs
            .values()
            .filter(|job| job.record.effective_state(now) == state)
            .collect();
        jobs.sort_by_key(|job| (job.index_time(), job.seq));

        Ok(jobs
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|job| job.record.clone())
            .collect())
    }

    async fn counts(&self, queue: &str, now: DateTime<Utc>) -> JobResult<StateCounts> {
        let state = self.state.lock();
        let mut counts = StateCounts::default();

        if let Some(queue) = state.queues.get(queue) {
            for job in queue.jobs.values() {
                match job.record.effective_state(now) {
                    JobState::Waiting => counts.waiting += 1,
                    JobState::Delayed => counts.delayed += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                }
            }
        }

        Ok(counts)
    }

    async fn oldest_waiting(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<DateTime<Utc>>> {
        let state = self.state.lock();
        Ok(state.queues.get(queue).and_then(|queue| {
            queue
                .jobs
                .values()
                .filter(|job| job.record.effective_state(now) == JobState::Waiting)
                .map(|job| job.record.scheduled_at)
                .min()
        }))
    }

    async fn stale_active(
        &self,
        queue: &str,
        claimed_before: DateTime<Utc>,
    ) -> JobResult<Vec<JobRecord>> {
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|queue| {
                queue
                    .jobs
                    .values()
                    .filter(|job| {
                        job.record.state == JobState::Active && job.index_time() < claimed_before
                    })
                    .map(|job| job.record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn heartbeat(&self, queue: &str, worker_id: &str, ttl: Duration) -> JobResult<()> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut state = self.state.lock();
        let workers = &mut state.queues.entry(queue.to_string()).or_default().workers;
        workers.retain(|_, expires| *expires > now);
        workers.insert(worker_id.to_string(), expires_at);
        Ok(())
    }

    async fn remove_worker(&self, queue: &str, worker_id: &str) -> JobResult<()> {
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get_mut(queue) {
            queue.workers.remove(worker_id);
        }
        Ok(())
    }

    async fn live_workers(&self, queue: &str, now: DateTime<Utc>) -> JobResult<u64> {
        let state = self.state.lock();
        let Some(queue) = state.queues.get(queue) else {
            return Ok(0);
        };
        let live = queue
            .workers
            .values()
            .filter(|expires_at| **expires_at > now)
            .count();
        Ok(live as u64)
    }

    async fn known_queues(&self) -> JobResult<Vec<String>> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| !queue.jobs.is_empty() || !queue.workers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn ping(&self) -> JobResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Priority;
    use crate::retry::BackoffPolicy;
    use serde_json::json;

    fn job(id: &str, scheduled_at: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: JobId::from(id),
            queue: "default".into(),
            handler: "noop".into(),
            payload: json!({ "id": id }),
            state: JobState::Waiting,
            priority: Priority::Normal,
            attempts: 0,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            scheduled_at,
            resource_lock_key: None,
            dedupe_key: None,
            idempotency_key: None,
            timeout_ms: None,
            created_at: scheduled_at,
            started_at: None,
            finished_at: None,
            worker_id: None,
            last_error: None,
            result: None,
        }
    }

    #[tokio::test]
    async fn test_lock_store_set_if_absent() {
        let store = MemoryLockStore::new();
        let ttl = Duration::from_secs(5);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_lock_store_expiry_frees_key() {
        let store = MemoryLockStore::new();

        assert!(store
            .set_if_absent("k", "a", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store
            .set_if_absent("k", "b", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_lock_store_compare_ops() {
        let store = MemoryLockStore::new();
        store
            .set_if_absent("k", "a", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!store.compare_and_delete("k", "b").await.unwrap());
        assert!(store.compare_and_swap("k", "a", "c").await.unwrap());
        assert!(!store
            .compare_and_expire("k", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store
            .compare_and_expire("k", "c", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store.compare_and_delete("k", "c").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_store_unavailable() {
        let store = MemoryLockStore::new();
        store.set_unavailable(true);

        let err = store
            .set_if_absent("k", "a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LockStoreUnavailable(_)));

        store.set_unavailable(false);
        assert!(store
            .set_if_absent("k", "a", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_claim_respects_schedule_and_priority() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        store
            .insert(&job("later", now + chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .insert(&job("early", now - chrono::Duration::seconds(10)))
            .await
            .unwrap();
        store
            .insert(&job("recent", now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let mut urgent = job("urgent", now);
        urgent.priority = Priority::Critical;
        store.insert(&urgent).await.unwrap();

        let order: Vec<String> = {
            let mut ids = Vec::new();
            while let Some(job) = store.claim("default", "w1", now).await.unwrap() {
                assert_eq!(job.state, JobState::Active);
                assert_eq!(job.worker_id.as_deref(), Some("w1"));
                ids.push(job.id.to_string());
            }
            ids
        };

        assert_eq!(order, vec!["urgent", "early", "recent"]);
    }

    #[tokio::test]
    async fn test_dedupe_returns_existing_until_terminal() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let mut first = job("first", now);
        first.dedupe_key = Some("sitemap".into());
        let mut second = job("second", now);
        second.dedupe_key = Some("sitemap".into());

        assert_eq!(
            store.insert(&first).await.unwrap(),
            InsertOutcome::Inserted(JobId::from("first"))
        );
        assert_eq!(
            store.insert(&second).await.unwrap(),
            InsertOutcome::Duplicate(JobId::from("first"))
        );

        let mut claimed = store.claim("default", "w1", now).await.unwrap().unwrap();
        claimed.state = JobState::Completed;
        claimed.finished_at = Some(now);
        store.update(&claimed).await.unwrap();

        assert_eq!(
            store.insert(&second).await.unwrap(),
            InsertOutcome::Inserted(JobId::from("second"))
        );
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.insert(&job("a", now)).await.unwrap();
        store.insert(&job("b", now)).await.unwrap();

        let cancelled = store.cancel("default", &JobId::from("a")).await.unwrap();
        assert_eq!(cancelled.id.as_str(), "a");
        assert!(store.get("default", &JobId::from("a")).await.unwrap().is_none());

        store.claim("default", "w1", now).await.unwrap().unwrap();
        let err = store.cancel("default", &JobId::from("b")).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));

        let err = store.cancel("default", &JobId::from("zzz")).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let store = MemoryJobStore::with_retention(RetentionPolicy {
            completed: 2,
            failed: 10,
        });
        let now = Utc::now();

        for i in 0..4 {
            let mut record = job(&format!("j{}", i), now);
            record.state = JobState::Completed;
            record.finished_at = Some(now + chrono::Duration::seconds(i));
            store.update(&record).await.unwrap();
        }

        let kept: Vec<String> = store
            .list("default", JobState::Completed, 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id.to_string())
            .collect();
        assert_eq!(kept, vec!["j2", "j3"]);
    }

    #[tokio::test]
    async fn test_counts_split_waiting_and_delayed() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        store.insert(&job("due", now)).await.unwrap();
        let mut retry = job("retry", now + chrono::Duration::minutes(5));
        retry.state = JobState::Delayed;
        store.insert(&retry).await.unwrap();

        let counts = store.counts("default", now).await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.delayed, 1);
        assert_eq!(
            store.oldest_waiting("default", now).await.unwrap(),
            Some(now)
        );
    }

    #[tokio::test]
    async fn test_worker_heartbeats_expire() {
        let store = MemoryJobStore::new();
        store
            .heartbeat("default", "w1", Duration::from_secs(30))
            .await
            .unwrap();
        store
            .heartbeat("default", "w2", Duration::from_secs(30))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(store.live_workers("default", now).await.unwrap(), 2);

        store.remove_worker("default", "w2").await.unwrap();
        assert_eq!(store.live_workers("default", now).await.unwrap(), 1);

        let later = now + chrono::Duration::minutes(1);
        assert_eq!(store.live_workers("default", later).await.unwrap(), 0);
        assert_eq!(store.known_queues().await.unwrap(), vec!["default"]);
    }

    #[tokio::test]
    async fn test_counting_workers_does_not_prune() {
        let store = MemoryJobStore::new();
        store
            .heartbeat("default", "gone", Duration::ZERO)
            .await
            .unwrap();
        store
            .heartbeat("default", "alive", Duration::from_secs(30))
            .await
            .unwrap();
        let worker_entries = |store: &MemoryJobStore| {
            store.state.lock().queues["default"].workers.len()
        };

        // "gone" expired before "alive" beat, so that heartbeat pruned it.
        assert_eq!(worker_entries(&store), 1);

        store
            .heartbeat("default", "stale", Duration::ZERO)
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.live_workers("default", later).await.unwrap(), 1);
        assert_eq!(store.live_workers("default", later).await.unwrap(), 1);
        assert_eq!(worker_entries(&store), 2);
    }

    #[tokio::test]
    async fn test_stale_active() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.insert(&job("a", now)).await.unwrap();
        store.claim("default", "w1", now).await.unwrap();

        assert!(store.stale_active("default", now).await.unwrap().is_empty());
        let stale = store
            .stale_active("default", now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }
}
