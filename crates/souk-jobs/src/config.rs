//! Job coordination configuration.

use crate::retry::BackoffPolicy;
use crate::store::RetentionPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the job coordination core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Defaults applied to jobs that do not override them.
    #[serde(default)]
    pub defaults: JobDefaults,

    /// Dispatch loop configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Per-queue settings keyed by queue name.
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,

    /// Distributed lock defaults.
    #[serde(default)]
    pub lock: LockConfig,

    /// Idempotency guard defaults.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Health monitor configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Cron scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl JobsConfig {
    /// Settings for `queue`, falling back to defaults for unconfigured queues.
    pub fn queue(&self, queue: &str) -> QueueConfig {
        self.queues.get(queue).cloned().unwrap_or_default()
    }

    /// Names of all configured queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execution timeout for a job on `queue` without its own override.
    pub fn job_timeout(&self, queue: &str) -> Duration {
        let secs = self
            .queues
            .get(queue)
            .and_then(|q| q.job_timeout_secs)
            .unwrap_or(self.defaults.job_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Every handler name referenced by configuration.
    pub fn referenced_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .values()
            .flat_map(|q| q.handlers.iter().cloned())
            .chain(self.scheduler.jobs.iter().map(|j| j.handler.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for every key the core writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "souk".to_string()
}

/// Per-job defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Execution timeout in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Largest accepted serialized payload.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
            job_timeout_secs: default_job_timeout(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_payload_bytes() -> usize {
    512 * 1024
}

/// Dispatch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Sleep between empty polls in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long shutdown waits for in-flight handlers.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// How often Active jobs are checked for abandoned workers.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Slack added to a job's timeout before it is considered abandoned.
    #[serde(default = "default_stale_grace")]
    pub stale_grace_secs: u64,

    /// Delay before a job that lost lock contention is retried.
    #[serde(default = "default_contention_delay")]
    pub contention_delay_ms: u64,

    #[serde(default = "default_retention_completed")]
    pub retention_completed: usize,

    #[serde(default = "default_retention_failed")]
    pub retention_failed: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reaper_interval_secs: default_reaper_interval(),
            stale_grace_secs: default_stale_grace(),
            contention_delay_ms: default_contention_delay(),
            retention_completed: default_retention_completed(),
            retention_failed: default_retention_failed(),
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }

    pub fn contention_delay(&self) -> Duration {
        Duration::from_millis(self.contention_delay_ms)
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            completed: self.retention_completed,
            failed: self.retention_failed,
        }
    }
}

fn default_poll_interval() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_stale_grace() -> u64 {
    60
}

fn default_contention_delay() -> u64 {
    500
}

fn default_retention_completed() -> usize {
    1_000
}

fn default_retention_failed() -> usize {
    10_000
}

/// Per-queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum jobs of this queue in flight per process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Overrides `defaults.job_timeout_secs` for this queue.
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,

    /// Handlers this queue is expected to run; checked at startup.
    #[serde(default)]
    pub handlers: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_timeout_secs: None,
            handlers: Vec::new(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

/// Distributed lock defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl")]
    pub default_ttl_ms: u64,

    /// How long acquisition polls a held lock before giving up.
    #[serde(default = "default_lock_wait")]
    pub default_wait_ms: u64,

    #[serde(default = "default_lock_retry_interval")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_lock_max_retry_interval")]
    pub max_retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl(),
            default_wait_ms: default_lock_wait(),
            retry_interval_ms: default_lock_retry_interval(),
            max_retry_interval_ms: default_lock_max_retry_interval(),
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.default_wait_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms)
    }
}

fn default_lock_ttl() -> u64 {
    30_000
}

fn default_lock_wait() -> u64 {
    2_000
}

fn default_lock_retry_interval() -> u64 {
    25
}

fn default_lock_max_retry_interval() -> u64 {
    250
}

/// Idempotency guard defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Replay-protection window in seconds.
    #[serde(default = "default_idempotency_ttl")]
    pub default_ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_idempotency_ttl(),
        }
    }
}

impl IdempotencyConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

fn default_idempotency_ttl() -> u64 {
    86_400 // 24 hours
}

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sampling interval in seconds.
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            thresholds: HealthThresholds::default(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    30
}

/// Warning and critical levels for queue health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    #[serde(default = "default_warning_waiting")]
    pub warning_waiting: u64,

    #[serde(default = "default_critical_waiting")]
    pub critical_waiting: u64,

    /// Oldest waiting job age in seconds.
    #[serde(default = "default_warning_age")]
    pub warning_age_secs: u64,

    #[serde(default = "default_critical_age")]
    pub critical_age_secs: u64,

    #[serde(default)]
    pub warning_failed: Option<u64>,

    #[serde(default)]
    pub critical_failed: Option<u64>,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_waiting: default_warning_waiting(),
            critical_waiting: default_critical_waiting(),
            warning_age_secs: default_warning_age(),
            critical_age_secs: default_critical_age(),
            warning_failed: None,
            critical_failed: None,
        }
    }
}

fn default_warning_waiting() -> u64 {
    1_000
}

fn default_critical_waiting() -> u64 {
    5_000
}

fn default_warning_age() -> u64 {
    3_600
}

fn default_critical_age() -> u64 {
    21_600
}

/// Cron scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the scheduler.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tick interval in milliseconds.
    #[serde(default = "default_scheduler_poll_interval")]
    pub poll_interval_ms: u64,

    /// Leader lock TTL in seconds.
    #[serde(default = "default_leader_ttl")]
    pub leader_ttl_secs: u64,

    /// Recurring jobs.
    #[serde(default)]
    pub jobs: Vec<ScheduledJobConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_scheduler_poll_interval(),
            leader_ttl_secs: default_leader_ttl(),
            jobs: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn leader_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_ttl_secs)
    }
}

fn default_scheduler_poll_interval() -> u64 {
    1_000
}

fn default_leader_ttl() -> u64 {
    30
}

/// A recurring job declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJobConfig {
    /// Unique schedule name.
    pub name: String,

    /// Cron expression with a seconds field, e.g. `0 0 * * * *`.
    pub cron: String,

    #[serde(default = "default_queue")]
    pub queue: String,

    pub handler: String,

    #[serde(default)]
    pub payload: Value,
}

fn default_queue() -> String {
    "default".to_string()
}
