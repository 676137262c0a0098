//! Redis implementation of the job store.
//!
//! Layout per queue (all under the configured prefix):
//!
//! ```text
//! queue:{name}:job:{id}          job record JSON
//! queue:{name}:pending:{tier}    ZSET id -> scheduled_at ms, one per priority
//! queue:{name}:active            ZSET id -> claimed at ms
//! queue:{name}:completed         ZSET id -> finished at ms
//! queue:{name}:failed            ZSET id -> finished at ms
//! queue:{name}:dedupe:{key}      id of the job owning the dedupe key
//! queue:{name}:workers           ZSET worker id -> heartbeat expiry ms
//! queues                         SET of queue names
//! ```

use super::scripts;
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState, Priority};
use crate::keys::StoreKeys;
use crate::store::{InsertOutcome, JobStore, RetentionPolicy, StateCounts};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, warn};

/// Redis-backed [`JobStore`].
pub struct RedisJobStore {
    pool: Pool,
    keys: StoreKeys,
    retention: RetentionPolicy,
    insert: Script,
    claim: Script,
    cancel: Script,
    trim: Script,
    release_dedupe: Script,
}

impl RedisJobStore {
    pub fn new(pool: Pool, keys: StoreKeys, retention: RetentionPolicy) -> Self {
        Self {
            pool,
            keys,
            retention,
            insert: Script::new(scripts::INSERT_JOB),
            claim: Script::new(scripts::CLAIM_JOB),
            cancel: Script::new(scripts::CANCEL_JOB),
            trim: Script::new(scripts::TRIM_INDEX),
            release_dedupe: Script::new(scripts::COMPARE_AND_DELETE),
        }
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn pending_keys(&self, queue: &str) -> Vec<String> {
        Priority::ALL
            .iter()
            .map(|priority| self.keys.pending(queue, *priority))
            .collect()
    }

    async fn load_many(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &str,
        ids: &[String],
    ) -> JobResult<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let job_keys: Vec<String> = ids.iter().map(|id| self.keys.job(queue, id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&job_keys)
            .query_async(&mut **conn)
            .await?;

        let mut jobs = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            match JobRecord::from_json(&json) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(queue = %queue, error = %e, "Skipping undecodable job record"),
            }
        }
        Ok(jobs)
    }

    async fn release_dedupe(
        &self,
        conn: &mut deadpool_redis::Connection,
        job: &JobRecord,
    ) -> JobResult<()> {
        if let Some(key) = &job.dedupe_key {
            let _: i32 = self
                .release_dedupe
                .key(self.keys.dedupe(&job.queue, key))
                .arg(job.id.as_str())
                .invoke_async(&mut **conn)
                .await?;
        }
        Ok(())
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: &JobRecord) -> JobResult<InsertOutcome> {
        let mut conn = self.conn().await?;
        let json = job.to_json()?;

        let mut invocation = self.insert.prepare_invoke();
        invocation
            .key(self.keys.job(&job.queue, job.id.as_str()))
            .key(self.keys.pending(&job.queue, job.priority))
            .key(self.keys.queues())
            .key(self.keys.state_index(&job.queue, JobState::Completed))
            .key(self.keys.state_index(&job.queue, JobState::Failed));
        if let Some(dedupe) = &job.dedupe_key {
            invocation.key(self.keys.dedupe(&job.queue, dedupe));
        }
        invocation
            .arg(job.id.as_str())
            .arg(&json)
            .arg(job.score())
            .arg(&job.queue)
            .arg(self.keys.job_prefix(&job.queue));

        let (inserted, id): (i32, String) = invocation.invoke_async(&mut *conn).await?;

        if inserted == 1 {
            debug!(job_id = %id, queue = %job.queue, "Stored job");
            Ok(InsertOutcome::Inserted(JobId::from(id)))
        } else {
            debug!(job_id = %id, queue = %job.queue, "Duplicate job suppressed");
            Ok(InsertOutcome::Duplicate(JobId::from(id)))
        }
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;

        let mut invocation = self.claim.prepare_invoke();
        for key in self.pending_keys(queue) {
            invocation.key(key);
        }
        invocation
            .key(self.keys.state_index(queue, JobState::Active))
            .arg(now.timestamp_millis());

        let claimed: Option<String> = invocation.invoke_async(&mut *conn).await?;
        let Some(id) = claimed else {
            return Ok(None);
        };

        let json: Option<String> = conn.get(self.keys.job(queue, &id)).await?;
        let Some(json) = json else {
            // Record was purged underneath the index entry.
            let _: () = conn
                .zrem(self.keys.state_index(queue, JobState::Active), &id)
                .await?;
            warn!(job_id = %id, queue = %queue, "Claimed job has no record");
            return Ok(None);
        };

        let mut job = JobRecord::from_json(&json)?;
        job.state = JobState::Active;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        drop(conn);
        self.update(&job).await?;

        Ok(Some(job))
    }

    async fn update(&self, job: &JobRecord) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let queue = job.queue.as_str();
        let id = job.id.as_str();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.job(queue, id), job.to_json()?)
            .ignore();
        for key in self.pending_keys(queue) {
            pipe.zrem(key, id).ignore();
        }
        for state in [JobState::Active, JobState::Completed, JobState::Failed] {
            pipe.zrem(self.keys.state_index(queue, state), id).ignore();
        }

        let target = if job.state.is_pending() {
            self.keys.pending(queue, job.priority)
        } else {
            self.keys.state_index(queue, job.state)
        };
        pipe.zadd(target, id, job.index_time().timestamp_millis())
            .ignore()
            .sadd(self.keys.queues(), queue)
            .ignore();

        let _: () = pipe.query_async(&mut *conn).await?;

        if job.state.is_terminal() {
            self.release_dedupe(&mut conn, job).await?;
        }

        if let Some(keep) = self.retention.limit_for(job.state) {
            let evicted: i64 = self
                .trim
                .key(self.keys.state_index(queue, job.state))
                .arg(keep)
                .arg(self.keys.job_prefix(queue))
                .invoke_async(&mut *conn)
                .await?;
            if evicted > 0 {
                debug!(queue = %queue, state = %job.state, evicted, "Trimmed terminal jobs");
            }
        }

        Ok(())
    }

    async fn get(&self, queue: &str, id: &JobId) -> JobResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let json: Option<String> = conn.get(self.keys.job(queue, id.as_str())).await?;
        json.map(|json| JobRecord::from_json(&json)).transpose()
    }

    async fn cancel(&self, queue: &str, id: &JobId) -> JobResult<JobRecord> {
        let mut conn = self.conn().await?;

        let mut invocation = self.cancel.prepare_invoke();
        invocation.key(self.keys.job(queue, id.as_str()));
        for key in self.pending_keys(queue) {
            invocation.key(key);
        }
        invocation.arg(id.as_str());

        let (status, raw): (i32, String) = invocation.invoke_async(&mut *conn).await?;
        match status {
            1 => {
                let job = JobRecord::from_json(&raw)?;
                self.release_dedupe(&mut conn, &job).await?;
                Ok(job)
            }
            2 => {
                let job = JobRecord::from_json(&raw)?;
                Err(JobError::InvalidState {
                    expected: "waiting or delayed".to_string(),
                    actual: job.state.to_string(),
                })
            }
            _ => Err(JobError::NotFound(id.to_string())),
        }
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        if !state.is_pending() {
            let start = offset as isize;
            let stop = (offset + limit - 1) as isize;
            let ids: Vec<String> = conn
                .zrange(self.keys.state_index(queue, state), start, stop)
                .await?;
            return self.load_many(&mut conn, queue, &ids).await;
        }

        let now = Utc::now().timestamp_millis();
        let (min, max) = match state {
            JobState::Waiting => ("-inf".to_string(), now.to_string()),
            _ => (format!("({}", now), "+inf".to_string()),
        };

        let mut ids = Vec::new();
        for key in self.pending_keys(queue) {
            let tier: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(&min)
                .arg(&max)
                .arg("LIMIT")
                .arg(0)
                .arg(offset + limit)
                .query_async(&mut *conn)
                .await?;
            ids.extend(tier);
        }

        let mut jobs = self.load_many(&mut conn, queue, &ids).await?;
        jobs.sort_by_key(|job| job.scheduled_at);
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn counts(&self, queue: &str, now: DateTime<Utc>) -> JobResult<StateCounts> {
        let mut conn = self.conn().await?;
        let now_ms = now.timestamp_millis();

        let mut pipe = redis::pipe();
        for key in self.pending_keys(queue) {
            pipe.zcount(&key, "-inf", now_ms)
                .zcount(&key, format!("({}", now_ms), "+inf");
        }
        for state in [JobState::Active, JobState::Completed, JobState::Failed] {
            pipe.zcard(self.keys.state_index(queue, state));
        }

        let replies: Vec<u64> = pipe.query_async(&mut *conn).await?;
        let tiers = Priority::ALL.len();
        let mut counts = StateCounts::default();
        for pair in replies.chunks_exact(2).take(tiers) {
            counts.waiting += pair[0];
            counts.delayed += pair[1];
        }
        counts.active = replies.get(tiers * 2).copied().unwrap_or_default();
        counts.completed = replies.get(tiers * 2 + 1).copied().unwrap_or_default();
        counts.failed = replies.get(tiers * 2 + 2).copied().unwrap_or_default();

        Ok(counts)
    }

    async fn oldest_waiting(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn().await?;
        let mut oldest: Option<i64> = None;

        for key in self.pending_keys(queue) {
            let head: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(now.timestamp_millis())
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(0)
                .arg(1)
                .query_async(&mut *conn)
                .await?;
            if let Some((_, score)) = head.first() {
                let score = *score as i64;
                oldest = Some(oldest.map_or(score, |current| current.min(score)));
            }
        }

        Ok(oldest.map(from_millis))
    }

    async fn stale_active(
        &self,
        queue: &str,
        claimed_before: DateTime<Utc>,
    ) -> JobResult<Vec<JobRecord>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.state_index(queue, JobState::Active))
            .arg("-inf")
            .arg(format!("({}", claimed_before.timestamp_millis()))
            .query_async(&mut *conn)
            .await?;
        self.load_many(&mut conn, queue, &ids).await
    }

    async fn heartbeat(&self, queue: &str, worker_id: &str, ttl: Duration) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let key = self.keys.workers(queue);
        let now_ms = Utc::now().timestamp_millis();
        let expires_at =
            now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

        // Expired heartbeats are pruned here so that reads stay side-effect free.
        let _: () = redis::pipe()
            .zrembyscore(&key, "-inf", now_ms)
            .ignore()
            .zadd(&key, worker_id, expires_at)
            .ignore()
            .sadd(self.keys.queues(), queue)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn remove_worker(&self, queue: &str, worker_id: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zrem(self.keys.workers(queue), worker_id).await?;
        Ok(())
    }

    async fn live_workers(&self, queue: &str, now: DateTime<Utc>) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let live: u64 = conn
            .zcount(
                self.keys.workers(queue),
                format!("({}", now.timestamp_millis()),
                "+inf",
            )
            .await?;
        Ok(live)
    }

    async fn known_queues(&self) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut names: Vec<String> = conn.smembers(self.keys.queues()).await?;
        names.sort();
        Ok(names)
    }

    async fn ping(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }
}
