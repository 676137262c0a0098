//! Queue and dispatcher.
//!
//! Producers call [`Dispatcher::enqueue`]; [`Dispatcher::run`] then starts a
//! fixed number of worker loops per queue. Each loop claims the earliest
//! eligible job, holds its resource lock (if any) while the handler runs, and
//! settles the outcome:
//!
//! ```text
//!             claim                   handler ok
//!  Waiting ───────────► Active ───────────────────────► Completed
//!     ▲                   │
//!     │ delay elapses     │ retriable error, attempts left
//!     │                   ├──────────────────────────► Delayed
//!  Delayed ◄──────────────┤ lock busy / store down (attempt not counted)
//!                         │
//!                         │ permanent error or attempts exhausted
//!                         └──────────────────────────► Failed (dead letter)
//! ```
//!
//! All shared state lives in the [`JobStore`]; any number of dispatcher
//! processes can serve the same queues.

use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::handler::{HandlerContext, HandlerRegistry, JobHandler};
use crate::idempotency::IdempotencyGuard;
use crate::job::{EnqueueOptions, Job, JobId, JobRecord, JobState};
use crate::lock::{KeepAlive, LockLease, LockManager};
use crate::metrics::JobMetrics;
use crate::retry::RetryDecision;
use crate::store::{InsertOutcome, JobStore, StateCounts};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Result of one dispatch.
#[derive(Debug)]
enum Outcome {
    /// Handler succeeded, or an idempotency record already held the result.
    Completed { result: Value, replayed: bool },
    /// Handler failed.
    Failed(JobError),
    /// Not run; put back without consuming an attempt.
    Deferred(String),
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub id: String,
    pub running: bool,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub jobs_deferred: u64,
}

/// Accepts jobs and runs them through registered handlers.
pub struct Dispatcher {
    id: String,
    store: Arc<dyn JobStore>,
    locks: Arc<LockManager>,
    idempotency: Arc<IdempotencyGuard>,
    handlers: HandlerRegistry,
    config: JobsConfig,
    /// Stops claiming new jobs.
    shutdown: CancellationToken,
    /// Cancels in-flight handlers once the shutdown grace period ends.
    abort: CancellationToken,
    running: AtomicBool,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_deferred: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<LockManager>,
        idempotency: Arc<IdempotencyGuard>,
        config: JobsConfig,
    ) -> Self {
        Self {
            id: format!("dispatcher-{}", Uuid::new_v4()),
            store,
            locks,
            idempotency,
            handlers: HandlerRegistry::new(),
            config,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            running: AtomicBool::new(false),
            jobs_processed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_deferred: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Registers `handler` under `name`, replacing any earlier registration.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.register(name, handler);
    }

    /// Registers an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<Value>> + Send + 'static,
    {
        self.handlers.register_fn(name, f);
    }

    /// Registers a typed job.
    pub fn register_job<J: Job>(&self) {
        self.handlers.register_job::<J>();
    }

    /// Checks that every handler named in configuration is registered.
    pub fn validate_handlers(&self) -> JobResult<()> {
        self.handlers
            .ensure_registered(self.config.referenced_handlers())
    }

    /// Queues served by [`run`](Self::run).
    pub fn queues(&self) -> Vec<String> {
        let names = self.config.queue_names();
        if names.is_empty() {
            vec!["default".to_string()]
        } else {
            names
        }
    }

    /// Submits a job.
    ///
    /// Fails with `InvalidJob` for an unregistered handler, an oversized
    /// payload, or an empty queue name. If a non-terminal job already owns
    /// the dedupe key (or the caller-supplied id), nothing is written and the
    /// existing id is returned.
    pub async fn enqueue(
        &self,
        queue: &str,
        handler: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> JobResult<JobId> {
        if queue.trim().is_empty() {
            return Err(JobError::InvalidJob("queue name must not be empty".to_string()));
        }
        if !self.handlers.contains(handler) {
            return Err(JobError::InvalidJob(format!(
                "handler not registered: {}",
                handler
            )));
        }

        let size = serde_json::to_vec(&payload)?.len();
        let limit = self.config.defaults.max_payload_bytes;
        if size > limit {
            return Err(JobError::InvalidJob(format!(
                "payload is {} bytes, limit is {}",
                size, limit
            )));
        }

        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.defaults.max_attempts);
        if max_attempts == 0 {
            return Err(JobError::InvalidJob(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let now = Utc::now();
        let scheduled_at = options.scheduled_at(now).ok_or_else(|| {
            JobError::InvalidJob("delay is too far in the future".to_string())
        })?;
        let record = JobRecord {
            id: options.job_id.clone().unwrap_or_default(),
            queue: queue.to_string(),
            handler: handler.to_string(),
            payload,
            state: if scheduled_at > now {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            priority: options.priority,
            attempts: 0,
            max_attempts,
            backoff: options.backoff.unwrap_or(self.config.defaults.backoff),
            scheduled_at,
            resource_lock_key: options.resource_lock_key,
            dedupe_key: options.dedupe_key,
            idempotency_key: options.idempotency_key,
            timeout_ms: options.timeout.map(|t| t.as_millis() as u64),
            created_at: now,
            started_at: None,
            finished_at: None,
            worker_id: None,
            last_error: None,
            result: None,
        };

        match self.store.insert(&record).await? {
            InsertOutcome::Inserted(id) => {
                JobMetrics::job_enqueued(queue, handler, record.priority.as_str());
                info!(
                    job_id = %id,
                    queue = %queue,
                    handler = %handler,
                    scheduled_at = %scheduled_at,
                    "Job enqueued"
                );
                Ok(id)
            }
            InsertOutcome::Duplicate(id) => {
                debug!(job_id = %id, queue = %queue, "Duplicate enqueue ignored");
                Ok(id)
            }
        }
    }

    /// Submits a typed job to [`Job::QUEUE`].
    pub async fn enqueue_job<J: Job>(&self, job: &J, options: EnqueueOptions) -> JobResult<JobId> {
        let payload = job.to_payload()?;
        self.enqueue(J::QUEUE, J::NAME, payload, job.apply_to(options))
            .await
    }

    pub async fn job(&self, queue: &str, id: &JobId) -> JobResult<Option<JobRecord>> {
        self.store.get(queue, id).await
    }

    /// Removes a Waiting or Delayed job.
    pub async fn cancel(&self, queue: &str, id: &JobId) -> JobResult<JobRecord> {
        let job = self.store.cancel(queue, id).await?;
        info!(job_id = %id, queue = %queue, "Job cancelled");
        Ok(job)
    }

    pub async fn list(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        self.store.list(queue, state, offset, limit).await
    }

    /// Failed jobs of `queue`, oldest first.
    pub async fn list_dead_letters(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        self.store.list(queue, JobState::Failed, offset, limit).await
    }

    /// Puts a dead-lettered job back to Waiting with its attempts reset.
    pub async fn requeue_dead_letter(&self, queue: &str, id: &JobId) -> JobResult<JobRecord> {
        let mut job = self
            .store
            .get(queue, id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if job.state != JobState::Failed {
            return Err(JobError::InvalidState {
                expected: JobState::Failed.to_string(),
                actual: job.state.to_string(),
            });
        }

        job.state = JobState::Waiting;
        job.attempts = 0;
        job.scheduled_at = Utc::now();
        job.started_at = None;
        job.finished_at = None;
        job.worker_id = None;
        job.result = None;
        self.store.update(&job).await?;

        info!(job_id = %id, queue = %queue, "Dead letter requeued");
        Ok(job)
    }

    pub async fn counts(&self, queue: &str) -> JobResult<StateCounts> {
        self.store.counts(queue, Utc::now()).await
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            id: self.id.clone(),
            running: self.running.load(Ordering::SeqCst),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_deferred: self.jobs_deferred.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals [`run`](Self::run) to stop claiming and drain.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Runs worker loops for every configured queue until [`stop`](Self::stop).
    ///
    /// On shutdown, in-flight handlers get `shutdown_timeout` to finish before
    /// their cancellation tokens fire and the loops are aborted.
    pub async fn run(self: Arc<Self>) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Internal("dispatcher already running".to_string()));
        }
        if let Err(e) = self.validate_handlers() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let mut workers = Vec::new();
        for queue in self.queues() {
            let concurrency = self.config.queue(&queue).concurrency.max(1);
            for slot in 0..concurrency {
                workers.push((queue.clone(), format!("{}-{}-{}", self.id, queue, slot)));
            }
        }

        info!(
            dispatcher_id = %self.id,
            queues = ?self.queues(),
            workers = workers.len(),
            "Starting dispatcher"
        );

        self.send_heartbeats(&workers).await;

        let mut tasks = JoinSet::new();
        for (queue, worker_id) in &workers {
            let span = info_span!("worker", queue = %queue, worker_id = %worker_id);
            tasks.spawn(
                Arc::clone(&self)
                    .worker_loop(queue.clone(), worker_id.clone())
                    .instrument(span),
            );
        }

        let mut maintenance = JoinSet::new();
        maintenance.spawn(Arc::clone(&self).heartbeat_loop(workers.clone()));
        maintenance.spawn(Arc::clone(&self).reaper_loop());

        self.shutdown.cancelled().await;
        info!(dispatcher_id = %self.id, "Dispatcher shutting down");
        maintenance.abort_all();

        let shutdown_timeout = self.config.dispatcher.shutdown_timeout();
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout_secs = shutdown_timeout.as_secs(),
                "In-flight jobs did not finish in time, cancelling"
            );
            self.abort.cancel();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        for (queue, worker_id) in &workers {
            if let Err(e) = self.store.remove_worker(queue, worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to deregister worker");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(dispatcher_id = %self.id, "Dispatcher stopped");
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, queue: String, worker_id: String) {
        debug!("Worker started");
        let poll_interval = self.config.dispatcher.poll_interval();

        while !self.shutdown.is_cancelled() {
            match self.dispatch_next(&queue, &worker_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to claim job"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        debug!("Worker stopped");
    }

    /// Claims and processes one job of `queue`. Returns false if nothing was
    /// eligible.
    pub async fn dispatch_next(&self, queue: &str, worker_id: &str) -> JobResult<bool> {
        let Some(job) = self.store.claim(queue, worker_id, Utc::now()).await? else {
            return Ok(false);
        };
        self.process(job, worker_id).await;
        Ok(true)
    }

    async fn process(&self, mut job: JobRecord, worker_id: &str) {
        debug!(job_id = %job.id, handler = %job.handler, "Processing job");
        let started = Instant::now();

        let lease = match job.resource_lock_key.as_deref() {
            Some(key) => {
                match self
                    .locks
                    .acquire(key, self.locks.default_ttl(), self.locks.default_wait())
                    .await
                {
                    Ok(Some(lease)) => Some(lease),
                    Ok(None) => {
                        let reason = format!("resource lock {} is held", key);
                        self.settle(job, Outcome::Deferred(reason), started).await;
                        return;
                    }
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Lock store unavailable");
                        self.settle(job, Outcome::Deferred(e.to_string()), started)
                            .await;
                        return;
                    }
                }
            }
            None => None,
        };

        let outcome = self.execute(&mut job, worker_id, lease.as_ref()).await;

        if let Some(lease) = lease {
            if let Err(e) = self.locks.release(&lease.key, &lease.owner_token).await {
                warn!(job_id = %job.id, key = %lease.key, error = %e, "Failed to release lock");
            }
        }

        self.settle(job, outcome, started).await;
    }

    /// Runs the handler under the job's timeout, consulting the idempotency
    /// guard when the job carries a key.
    async fn execute(
        &self,
        job: &mut JobRecord,
        worker_id: &str,
        lease: Option<&LockLease>,
    ) -> Outcome {
        let Some(handler) = self.handlers.get(&job.handler) else {
            return Outcome::Failed(JobError::HandlerNotFound(job.handler.clone()));
        };

        let mut claim = None;
        if let Some(key) = job.idempotency_key.clone() {
            match self.idempotency.get_result(&key).await {
                Ok(Some(result)) => {
                    return Outcome::Completed {
                        result,
                        replayed: true,
                    }
                }
                Ok(None) => {}
                Err(e) => return Outcome::Deferred(e.to_string()),
            }
            match self
                .idempotency
                .begin(&key, self.idempotency.default_ttl())
                .await
            {
                Ok(Some(begun)) => claim = Some(begun),
                Ok(None) => {
                    return Outcome::Deferred(format!("idempotency key {} is in progress", key))
                }
                Err(e) => return Outcome::Deferred(e.to_string()),
            }
        }

        job.attempts += 1;
        if let Err(e) = self.store.update(job).await {
            warn!(job_id = %job.id, error = %e, "Failed to record attempt");
        }

        let cancellation = self.abort.child_token();
        let keep_alive = lease.map(|lease| self.locks.keep_alive(lease, cancellation.clone()));

        let ctx = HandlerContext {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            handler: job.handler.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            scheduled_at: job.scheduled_at,
            started_at: job.started_at.unwrap_or_else(Utc::now),
            worker_id: worker_id.to_string(),
            lock_key: job.resource_lock_key.clone(),
            cancellation: cancellation.clone(),
        };

        let timeout = job
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.job_timeout(&job.queue));

        let invocation = AssertUnwindSafe(handler.handle(ctx, job.payload.clone())).catch_unwind();
        let lock_lost = async {
            match &keep_alive {
                Some(keep_alive) => keep_alive.lost().await,
                None => std::future::pending().await,
            }
        };

        // Exclusivity ends with the lease, so the handler is dropped rather
        // than allowed to finish without it.
        let mut result = tokio::select! {
            biased;
            () = lock_lost => {
                cancellation.cancel();
                Err(lock_lost_error(job))
            }
            invoked = tokio::time::timeout(timeout, invocation) => match invoked {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(JobError::transient(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Err(_) => {
                    cancellation.cancel();
                    Err(JobError::Timeout(timeout.as_millis() as u64))
                }
            },
        };

        if result.is_ok() && keep_alive.as_ref().is_some_and(KeepAlive::is_lost) {
            result = Err(lock_lost_error(job));
        }
        if let Some(keep_alive) = keep_alive {
            if keep_alive.is_lost() {
                warn!(job_id = %job.id, "Resource lock was lost during execution");
            }
        }

        if let Some(claim) = &claim {
            let recorded = match &result {
                Ok(value) => self.idempotency.complete_claim(claim, value.clone()).await,
                Err(_) => self.idempotency.abandon(claim).await,
            };
            match recorded {
                Ok(true) => {}
                Ok(false) => warn!(
                    job_id = %job.id,
                    key = %claim.key,
                    "Idempotency record expired during execution"
                ),
                Err(e) => warn!(
                    job_id = %job.id,
                    key = %claim.key,
                    error = %e,
                    "Failed to record idempotency outcome"
                ),
            }
        }

        match result {
            Ok(result) => Outcome::Completed {
                result,
                replayed: false,
            },
            Err(e) => Outcome::Failed(e),
        }
    }

    /// Persists the outcome of a dispatch.
    async fn settle(&self, mut job: JobRecord, outcome: Outcome, started: Instant) {
        let now = Utc::now();
        let elapsed = started.elapsed();

        match outcome {
            Outcome::Completed { result, replayed } => {
                job.state = JobState::Completed;
                job.finished_at = Some(now);
                job.result = Some(result);
                job.last_error = None;
                self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_completed(&job.queue, &job.handler, elapsed);
                info!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    replayed,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
            }
            Outcome::Deferred(reason) => {
                self.defer(&mut job, now, &reason);
            }
            Outcome::Failed(err) if !err.counts_as_attempt() => {
                job.attempts = job.attempts.saturating_sub(1);
                self.defer(&mut job, now, &err.to_string());
            }
            Outcome::Failed(err) => {
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_failed(&job.queue, &job.handler, error_type(&err), elapsed);

                let decision = if err.should_dead_letter() {
                    RetryDecision::Exhausted
                } else {
                    job.backoff.next_delay(job.attempts, job.max_attempts)
                };

                let dead_letter = match decision {
                    RetryDecision::RetryAfter(delay) => match checked_after(now, delay) {
                        Some(retry_at) => {
                            job.state = JobState::Delayed;
                            job.scheduled_at = retry_at;
                            job.started_at = None;
                            job.worker_id = None;
                            job.last_error = Some(err.to_string());
                            JobMetrics::job_retried(&job.queue, &job.handler, job.attempts);
                            info!(
                                job_id = %job.id,
                                attempts = job.attempts,
                                max_attempts = job.max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Job failed, retrying"
                            );
                            None
                        }
                        None => Some((
                            "backoff_overflow",
                            format!("retry delay {:?} is out of range: {}", delay, err),
                        )),
                    },
                    RetryDecision::Exhausted if err.should_dead_letter() => {
                        Some(("permanent", err.to_string()))
                    }
                    RetryDecision::Exhausted => {
                        let exhausted = JobError::Exhausted {
                            job_id: job.id.to_string(),
                            attempts: job.attempts,
                        };
                        Some(("exhausted", format!("{}: {}", exhausted, err)))
                    }
                };

                if let Some((reason, last_error)) = dead_letter {
                    job.state = JobState::Failed;
                    job.finished_at = Some(now);
                    job.last_error = Some(last_error);
                    JobMetrics::job_dead_lettered(&job.queue, &job.handler, reason);
                    warn!(
                        job_id = %job.id,
                        queue = %job.queue,
                        attempts = job.attempts,
                        reason,
                        error = %err,
                        "Job dead-lettered"
                    );
                }
            }
        }

        if let Err(e) = self.store.update(&job).await {
            error!(job_id = %job.id, state = %job.state, error = %e, "Failed to persist job outcome");
        }
    }

    fn defer(&self, job: &mut JobRecord, now: DateTime<Utc>, reason: &str) {
        let delay = self.config.dispatcher.contention_delay();
        job.state = JobState::Delayed;
        job.scheduled_at = after(now, delay);
        job.started_at = None;
        job.worker_id = None;
        self.jobs_deferred.fetch_add(1, Ordering::Relaxed);
        debug!(
            job_id = %job.id,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Job deferred"
        );
    }

    async fn send_heartbeats(&self, workers: &[(String, String)]) {
        let ttl = self.config.dispatcher.heartbeat_interval() * 3;
        for (queue, worker_id) in workers {
            if let Err(e) = self.store.heartbeat(queue, worker_id, ttl).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to send heartbeat");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, workers: Vec<(String, String)>) {
        let mut interval = tokio::time::interval(self.config.dispatcher.heartbeat_interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            self.send_heartbeats(&workers).await;
        }
    }

    async fn reaper_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.dispatcher.reaper_interval());
        loop {
            interval.tick().await;
            if let Err(e) = self.reap_stale().await {
                warn!(error = %e, "Stale job sweep failed");
            }
        }
    }

    /// Settles Active jobs whose worker stopped before finishing them.
    ///
    /// A job is stale once it has been Active longer than its timeout plus
    /// `stale_grace`. The lost execution was already counted as an attempt, so
    /// the job is retried or dead-lettered per its policy.
    pub async fn reap_stale(&self) -> JobResult<usize> {
        let now = Utc::now();
        let grace = self.config.dispatcher.stale_grace();
        let mut reaped = 0;

        for queue in self.queues() {
            let candidates = self.store.stale_active(&queue, before(now, grace)).await?;
            for job in candidates {
                let timeout = job
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.config.job_timeout(&queue));
                let claimed_at = job.started_at.unwrap_or(job.scheduled_at);
                if after(claimed_at, timeout + grace) > now {
                    continue;
                }

                warn!(
                    job_id = %job.id,
                    queue = %queue,
                    worker_id = job.worker_id.as_deref().unwrap_or("unknown"),
                    "Reaping abandoned job"
                );
                let err = JobError::transient("worker abandoned job");
                self.settle(job, Outcome::Failed(err), Instant::now()).await;
                reaped += 1;
            }
        }

        Ok(reaped)
    }
}

fn checked_after(at: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
}

/// `at + delay`, saturating at the latest representable time.
fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    checked_after(at, delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - delay`, saturating at the earliest representable time.
fn before(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_sub_signed(delay))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn lock_lost_error(job: &JobRecord) -> JobError {
    JobError::transient(format!(
        "resource lock {} lost during execution",
        job.resource_lock_key.as_deref().unwrap_or("unknown")
    ))
}

fn error_type(err: &JobError) -> &'static str {
    match err {
        JobError::TransientHandler(_) => "transient",
        JobError::PermanentHandler(_) => "permanent",
        JobError::Timeout(_) => "timeout",
        JobError::HandlerNotFound(_) => "handler_not_found",
        JobError::Serialization(_) | JobError::InvalidJob(_) => "invalid",
        JobError::Cancelled => "cancelled",
        _ => "internal",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
