//! Cron scheduler for recurring jobs with distributed leader election.
//!
//! Every process may run a [`Scheduler`], but only the one holding the
//! `scheduler:leader` lock enqueues. Each firing carries the dedupe key
//! `cron:{name}:{fire_ts}`, so two processes that both believe they lead
//! during a lease handover still produce a single job per firing.

use crate::config::{ScheduledJobConfig, SchedulerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{JobError, JobResult};
use crate::job::{EnqueueOptions, JobId};
use crate::keys::StoreKeys;
use crate::lock::{LockLease, LockManager};
use crate::metrics::SchedulerMetrics;
use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Scheduled job definition.
#[derive(Clone)]
pub struct ScheduledJob {
    /// Unique name for this scheduled job.
    pub name: String,

    /// Cron expression.
    pub cron: String,

    schedule: Schedule,

    pub queue: String,
    pub handler: String,
    pub payload: Value,

    /// Is job enabled.
    pub enabled: bool,
}

impl std::fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.name)
            .field("cron", &self.cron)
            .field("queue", &self.queue)
            .field("handler", &self.handler)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl ScheduledJob {
    pub fn new(
        name: impl Into<String>,
        cron_expr: &str,
        queue: impl Into<String>,
        handler: impl Into<String>,
        payload: Value,
    ) -> JobResult<Self> {
        let schedule = Schedule::from_str(cron_expr)
            .map_err(|e| JobError::Configuration(format!("Invalid cron expression: {}", e)))?;

        Ok(Self {
            name: name.into(),
            cron: cron_expr.to_string(),
            schedule,
            queue: queue.into(),
            handler: handler.into(),
            payload,
            enabled: true,
        })
    }

    pub fn from_config(config: &ScheduledJobConfig) -> JobResult<Self> {
        Self::new(
            config.name.clone(),
            &config.cron,
            config.queue.clone(),
            config.handler.clone(),
            config.payload.clone(),
        )
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Next fire time strictly after `from`.
    pub fn next_run_from(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// Latest fire time in `(after, until]`, with the number of earlier fire
    /// times in that window that it supersedes.
    fn latest_due(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Option<(DateTime<Utc>, usize)> {
        let mut latest = None;
        let mut skipped = 0;
        for fire in self.schedule.after(&after) {
            if fire > until {
                break;
            }
            if latest.is_some() {
                skipped += 1;
            }
            latest = Some(fire);
        }
        latest.map(|fire| (fire, skipped))
    }

    fn dedupe_key(&self, fire: DateTime<Utc>) -> String {
        format!("cron:{}:{}", self.name, fire.timestamp())
    }
}

/// Distributed cron scheduler.
pub struct Scheduler {
    id: String,
    dispatcher: Arc<Dispatcher>,
    locks: Arc<LockManager>,
    leader_key: String,
    config: SchedulerConfig,
    jobs: RwLock<HashMap<String, ScheduledJob>>,
    /// Fire times up to this instant have been handled, per job.
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
    lease: Mutex<Option<LockLease>>,
    is_leader: AtomicBool,
    running: AtomicBool,
    jobs_triggered: AtomicU64,
}

impl Scheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        locks: Arc<LockManager>,
        keys: &StoreKeys,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            id: format!("scheduler-{}", Uuid::new_v4()),
            dispatcher,
            locks,
            leader_key: keys.scheduler_leader().to_string(),
            config,
            jobs: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            lease: Mutex::new(None),
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            jobs_triggered: AtomicU64::new(0),
        }
    }

    /// Creates a scheduler with every job declared in `config.jobs`.
    pub fn from_config(
        dispatcher: Arc<Dispatcher>,
        locks: Arc<LockManager>,
        keys: &StoreKeys,
        config: SchedulerConfig,
    ) -> JobResult<Self> {
        let jobs = config
            .jobs
            .iter()
            .map(ScheduledJob::from_config)
            .collect::<JobResult<Vec<_>>>()?;
        let scheduler = Self::new(dispatcher, locks, keys, config);
        for job in jobs {
            scheduler.register(job);
        }
        Ok(scheduler)
    }

    /// Register a scheduled job.
    pub fn register(&self, job: ScheduledJob) {
        let name = job.name.clone();
        self.jobs.write().insert(name.clone(), job);
        self.cursors.lock().remove(&name);
        info!(job_name = %name, "Registered scheduled job");
    }

    /// Unregister a scheduled job.
    pub fn unregister(&self, name: &str) -> Option<ScheduledJob> {
        self.cursors.lock().remove(name);
        self.jobs.write().remove(name)
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquires or renews the leader lock. Store errors count as not leading.
    async fn refresh_leadership(&self) -> bool {
        let ttl = self.config.leader_ttl();
        let current = self.lease.lock().clone();

        let leading = match current {
            Some(lease) => match self.locks.renew(&lease.key, &lease.owner_token, ttl).await {
                Ok(true) => true,
                Ok(false) => {
                    warn!(scheduler_id = %self.id, "Scheduler leadership lost");
                    *self.lease.lock() = None;
                    false
                }
                Err(e) => {
                    warn!(scheduler_id = %self.id, error = %e, "Failed to renew leadership");
                    *self.lease.lock() = None;
                    false
                }
            },
            None => match self.locks.try_acquire(&self.leader_key, ttl).await {
                Ok(Some(lease)) => {
                    info!(scheduler_id = %self.id, "Acquired scheduler leadership");
                    *self.lease.lock() = Some(lease);
                    // Fire times missed before this process led are not backfilled.
                    self.cursors.lock().clear();
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    debug!(error = %e, "Leadership check failed");
                    false
                }
            },
        };

        self.is_leader.store(leading, Ordering::SeqCst);
        SchedulerMetrics::update_leader_status(&self.id, leading);
        leading
    }

    async fn release_leadership(&self) {
        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            match self.locks.release(&lease.key, &lease.owner_token).await {
                Ok(_) => info!(scheduler_id = %self.id, "Released scheduler leadership"),
                Err(e) => warn!(error = %e, "Failed to release leadership"),
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
        SchedulerMetrics::update_leader_status(&self.id, false);
    }

    /// One scheduling pass at the current time.
    pub async fn tick(&self) -> JobResult<Vec<JobId>> {
        self.tick_at(Utc::now()).await
    }

    /// One scheduling pass as of `now`.
    ///
    /// Enqueues at most one job per schedule: if several fire times passed
    /// since the last pass, only the latest is enqueued.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> JobResult<Vec<JobId>> {
        if !self.refresh_leadership().await {
            return Ok(Vec::new());
        }

        let due: Vec<(ScheduledJob, DateTime<Utc>)> = {
            let jobs = self.jobs.read();
            let mut cursors = self.cursors.lock();
            let mut due = Vec::new();

            for (name, job) in jobs.iter() {
                if !job.enabled {
                    continue;
                }
                let Some(after) = cursors.insert(name.clone(), now) else {
                    continue;
                };
                if let Some((fire, skipped)) = job.latest_due(after, now) {
                    if skipped > 0 {
                        warn!(job_name = %name, skipped, "Coalescing missed fire times");
                    }
                    due.push((job.clone(), fire));
                }
            }
            due
        };

        let mut enqueued = Vec::new();
        for (job, fire) in due {
            match self.fire(&job, fire).await {
                Ok(id) => enqueued.push(id),
                Err(e) => error!(job_name = %job.name, error = %e, "Failed to enqueue scheduled job"),
            }
        }
        Ok(enqueued)
    }

    async fn fire(&self, job: &ScheduledJob, fire: DateTime<Utc>) -> JobResult<JobId> {
        let id = self
            .dispatcher
            .enqueue(
                &job.queue,
                &job.handler,
                job.payload.clone(),
                EnqueueOptions::new().dedupe(job.dedupe_key(fire)),
            )
            .await?;

        self.jobs_triggered.fetch_add(1, Ordering::Relaxed);
        SchedulerMetrics::job_triggered(&job.name);
        debug!(job_name = %job.name, job_id = %id, fire_at = %fire, "Enqueued scheduled job");
        Ok(id)
    }

    /// Enqueues `name` immediately, regardless of leadership or its schedule.
    pub async fn trigger_job(&self, name: &str) -> JobResult<JobId> {
        let job = self
            .jobs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::NotFound(format!("scheduled job {}", name)))?;

        let id = self
            .dispatcher
            .enqueue(&job.queue, &job.handler, job.payload.clone(), EnqueueOptions::new())
            .await?;
        self.jobs_triggered.fetch_add(1, Ordering::Relaxed);
        SchedulerMetrics::job_triggered(&job.name);
        info!(job_name = %name, job_id = %id, "Manually triggered scheduled job");
        Ok(id)
    }

    /// Ticks until `shutdown` is cancelled, then releases leadership.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Scheduler already running".to_string()));
        }

        info!(
            scheduler_id = %self.id,
            poll_interval_ms = self.config.poll_interval_ms,
            jobs = self.jobs.read().len(),
            "Starting scheduler"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        self.release_leadership().await;
        self.running.store(false, Ordering::SeqCst);
        info!(scheduler_id = %self.id, "Scheduler stopped");
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            id: self.id.clone(),
            is_leader: self.is_leader(),
            scheduled_jobs: self.jobs.read().len(),
            jobs_triggered: self.jobs_triggered.load(Ordering::Relaxed),
        }
    }

    pub fn list_jobs(&self) -> Vec<ScheduledJobInfo> {
        let now = Utc::now();
        let mut jobs: Vec<ScheduledJobInfo> = self
            .jobs
            .read()
            .values()
            .map(|job| ScheduledJobInfo {
                name: job.name.clone(),
                cron: job.cron.clone(),
                queue: job.queue.clone(),
                handler: job.handler.clone(),
                enabled: job.enabled,
                next_run: job.next_run_from(now),
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn enable_job(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable_job(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.jobs.write().get_mut(name) {
            Some(job) => {
                job.enabled = enabled;
                info!(job_name = %name, enabled, "Scheduled job toggled");
                true
            }
            None => false,
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub id: String,
    pub is_leader: bool,
    pub scheduled_jobs: usize,
    pub jobs_triggered: u64,
}

/// Scheduled job info for listing.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJobInfo {
    pub name: String,
    pub cron: String,
    pub queue: String,
    pub handler: String,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
}

/// Common cron expressions.
pub mod cron_expressions {
    /// Every minute.
    pub const EVERY_MINUTE: &str = "0 * * * * *";

    /// Every 15 minutes.
    pub const EVERY_15_MINUTES: &str = "0 */15 * * * *";

    /// Every hour.
    pub const EVERY_HOUR: &str = "0 0 * * * *";

    /// Every day at midnight.
    pub const DAILY_MIDNIGHT: &str = "0 0 0 * * *";
}
