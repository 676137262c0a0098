//! Storage seams.
//!
//! [`LockStore`] is the thin adapter over the shared key-value store that the
//! lock manager and idempotency guard are built on. [`JobStore`] persists job
//! records and their per-queue state indexes. Both have a Redis implementation
//! in [`crate::redis`] and an in-process implementation in [`memory`].

pub mod memory;

pub use memory::{MemoryJobStore, MemoryLockStore};

use crate::error::JobResult;
use crate::job::{JobId, JobRecord, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Atomic single-key primitives.
///
/// Implementations report connectivity failures as
/// `JobError::LockStoreUnavailable`. A key whose TTL has passed is absent.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Sets `key` to `value` with `ttl` only if the key is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> JobResult<bool>;

    /// Deletes `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> JobResult<bool>;

    /// Resets the TTL of `key` only if it currently holds `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
        -> JobResult<bool>;

    /// Replaces the value of `key` with `value` only if it currently holds
    /// `expected`, keeping the remaining TTL.
    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> JobResult<bool>;

    /// Reads `key`.
    async fn get(&self, key: &str) -> JobResult<Option<String>>;
}

/// Result of inserting a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new job was stored.
    Inserted(JobId),
    /// A non-terminal job with the same dedupe key already exists.
    Duplicate(JobId),
}

impl InsertOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => id,
        }
    }

    pub fn into_job_id(self) -> JobId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => id,
        }
    }
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// Pending and due.
    pub waiting: u64,
    /// Pending with `scheduled_at` in the future.
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// How many terminal jobs each queue keeps. Oldest are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub completed: usize,
    pub failed: usize,
}

impl RetentionPolicy {
    /// Limit for a terminal state, `None` for non-terminal states.
    pub fn limit_for(&self, state: JobState) -> Option<usize> {
        match state {
            JobState::Completed => Some(self.completed),
            JobState::Failed => Some(self.failed),
            _ => None,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: 1_000,
            failed: 10_000,
        }
    }
}

/// Persistent job state.
///
/// Every mutation is atomic with respect to other workers so any number of
/// dispatcher processes can share one store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new pending job. If the job carries a dedupe key owned by a
    /// non-terminal job, nothing is written and that job's id is returned.
    async fn insert(&self, job: &JobRecord) -> JobResult<InsertOutcome>;

    /// Atomically claims the earliest eligible pending job of `queue`,
    /// highest priority tier first, and marks it Active for `worker_id`.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>>;

    /// Writes `job` and moves it to the index of its current state.
    ///
    /// Terminal states release the dedupe key and trim the state's index to
    /// the retention limit.
    async fn update(&self, job: &JobRecord) -> JobResult<()>;

    async fn get(&self, queue: &str, id: &JobId) -> JobResult<Option<JobRecord>>;

    /// Removes a job that has not been dispatched yet.
    ///
    /// Fails with `InvalidState` for Active or terminal jobs and `NotFound`
    /// for unknown ids.
    async fn cancel(&self, queue: &str, id: &JobId) -> JobResult<JobRecord>;

    /// Lists jobs in `state`, oldest first.
    async fn list(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>>;

    async fn counts(&self, queue: &str, now: DateTime<Utc>) -> JobResult<StateCounts>;

    /// `scheduled_at` of the longest-waiting eligible job.
    async fn oldest_waiting(&self, queue: &str, now: DateTime<Utc>)
        -> JobResult<Option<DateTime<Utc>>>;

    /// Active jobs claimed before `claimed_before`.
    async fn stale_active(
        &self,
        queue: &str,
        claimed_before: DateTime<Utc>,
    ) -> JobResult<Vec<JobRecord>>;

    /// Records that `worker_id` serves `queue` for the next `ttl`, dropping
    /// heartbeats of the queue that have already expired.
    async fn heartbeat(&self, queue: &str, worker_id: &str, ttl: Duration) -> JobResult<()>;

    async fn remove_worker(&self, queue: &str, worker_id: &str) -> JobResult<()>;

    /// Number of workers whose heartbeat has not expired. Read-only.
    async fn live_workers(&self, queue: &str, now: DateTime<Utc>) -> JobResult<u64>;

    /// Every queue that has ever received a job.
    async fn known_queues(&self) -> JobResult<Vec<String>>;

    async fn ping(&self) -> JobResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_outcome_job_id() {
        let inserted = InsertOutcome::Inserted(JobId::from("a"));
        let duplicate = InsertOutcome::Duplicate(JobId::from("b"));
        assert_eq!(inserted.job_id().as_str(), "a");
        assert_eq!(duplicate.into_job_id().as_str(), "b");
    }

    #[test]
    fn test_retention_limits() {
        let retention = RetentionPolicy {
            completed: 5,
            failed: 7,
        };
        assert_eq!(retention.limit_for(JobState::Completed), Some(5));
        assert_eq!(retention.limit_for(JobState::Failed), Some(7));
        assert_eq!(retention.limit_for(JobState::Waiting), None);
    }
}
