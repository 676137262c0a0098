//! Job records and submission options.

use crate::error::{JobError, JobResult};
use crate::handler::HandlerContext;
use crate::retry::BackoffPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a job. Exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for dispatch once `scheduled_at` has passed.
    #[default]
    Waiting,
    /// Claimed by a worker.
    Active,
    /// Handler succeeded.
    Completed,
    /// Dead letter.
    Failed,
    /// Waiting for a retry or lock-contention delay to elapse.
    Delayed,
}

impl JobState {
    /// Completed and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Waiting and Delayed jobs have not been dispatched yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority tier. Higher tiers are claimed first within a queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub handler: String,
    pub payload: Value,
    pub state: JobState,
    #[serde(default)]
    pub priority: Priority,
    /// Handler executions started so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Earliest dispatch time.
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_lock_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl JobRecord {
    /// Returns true if max attempts reached.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// State as observed at `now`: a Delayed job whose delay has elapsed is Waiting.
    pub fn effective_state(&self, now: DateTime<Utc>) -> JobState {
        if self.state == JobState::Delayed && self.scheduled_at <= now {
            JobState::Waiting
        } else {
            self.state
        }
    }

    /// Time the job entered its current state; orders each state index.
    pub fn index_time(&self) -> DateTime<Utc> {
        match self.state {
            JobState::Waiting | JobState::Delayed => self.scheduled_at,
            JobState::Active => self.started_at.unwrap_or(self.scheduled_at),
            JobState::Completed | JobState::Failed => self.finished_at.unwrap_or(self.scheduled_at),
        }
    }

    /// Scheduled time as epoch milliseconds, the score used by store indexes.
    pub fn score(&self) -> i64 {
        self.scheduled_at.timestamp_millis()
    }

    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Options accepted by `Dispatcher::enqueue`.
///
/// Unset fields fall back to the dispatcher's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub job_id: Option<JobId>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub delay: Option<Duration>,
    pub run_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub resource_lock_key: Option<String>,
    pub dedupe_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a caller-supplied job id instead of a generated one.
    pub fn job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    /// Delays the first dispatch.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Schedules the first dispatch at an absolute time.
    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.run_at = Some(when);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The dispatcher holds this lock for the duration of execution.
    pub fn resource_lock(mut self, key: impl Into<String>) -> Self {
        self.resource_lock_key = Some(key.into());
        self
    }

    /// Enqueue is a no-op while a non-terminal job with this key exists.
    pub fn dedupe(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Records the handler result once under this key.
    pub fn idempotency(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolves the first dispatch time relative to `now`, or `None` if the
    /// delay does not fit in a timestamp.
    pub fn scheduled_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(at) = self.run_at {
            return Some(at);
        }
        match self.delay {
            Some(delay) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay)),
            None => Some(now),
        }
    }
}

/// A typed job.
///
/// Implementors are serialized as the job payload and registered with
/// `HandlerRegistry::register_job`, which decodes the payload back into `Self`
/// before calling [`execute`](Job::execute).
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct RefreshRates { base: String }
///
/// #[async_trait::async_trait]
/// impl Job for RefreshRates {
///     const NAME: &'static str = "refresh_rates";
///     const QUEUE: &'static str = "currency";
///
///     async fn execute(&self, ctx: HandlerContext) -> JobResult<Value> {
///         Ok(json!({ "base": self.base }))
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Handler name this job is registered under.
    const NAME: &'static str;

    /// Queue name for this job type.
    const QUEUE: &'static str = "default";

    /// Execute the job.
    async fn execute(&self, ctx: HandlerContext) -> JobResult<Value>;

    /// Resource lock to hold while executing.
    fn resource_lock_key(&self) -> Option<String> {
        None
    }

    /// Key used to suppress duplicate scheduling.
    fn dedupe_key(&self) -> Option<String> {
        None
    }

    /// Key used to record the result exactly once.
    fn idempotency_key(&self) -> Option<String> {
        None
    }

    /// Fills job-derived keys into `options` where the caller left them unset.
    fn apply_to(&self, mut options: EnqueueOptions) -> EnqueueOptions {
        if options.resource_lock_key.is_none() {
            options.resource_lock_key = self.resource_lock_key();
        }
        if options.dedupe_key.is_none() {
            options.dedupe_key = self.dedupe_key();
        }
        if options.idempotency_key.is_none() {
            options.idempotency_key = self.idempotency_key();
        }
        options
    }

    /// Encodes the job as a payload.
    fn to_payload(&self) -> JobResult<Value> {
        serde_json::to_value(self).map_err(JobError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(state: JobState, scheduled_at: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: JobId::from("job-1"),
            queue: "default".into(),
            handler: "noop".into(),
            payload: Value::Null,
            state,
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

    #[test]
    fn test_job_id_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_eq!(JobId::from("abc").as_str(), "abc");
    }

    #[test]
    fn test_job_id_serializes_as_string() {
        let json = serde_json::to_string(&JobId::from("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }

    #[test]
    fn test_state_classification() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Delayed.is_pending());
        assert!(JobState::Waiting.is_pending());
        assert_eq!(JobState::Delayed.to_string(), "delayed");
    }

    #[test]
    fn test_effective_state_promotes_elapsed_delay() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let job = record(JobState::Delayed, at);

        assert_eq!(job.effective_state(at - chrono::Duration::seconds(1)), JobState::Delayed);
        assert_eq!(job.effective_state(at), JobState::Waiting);
        assert_eq!(record(JobState::Active, at).effective_state(at), JobState::Active);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::ALL[0], Priority::Critical);
    }

    #[test]
    fn test_record_json_roundtrip_keeps_state_field() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let job = record(JobState::Failed, at);
        let json = job.to_json().unwrap();
        assert!(json.contains(r#""state":"failed""#));
        assert_eq!(JobRecord::from_json(&json).unwrap(), job);
    }

    #[test]
    fn test_options_scheduled_at() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(EnqueueOptions::new().scheduled_at(now), Some(now));
        assert_eq!(
            EnqueueOptions::new().delay(Duration::from_secs(30)).scheduled_at(now),
            Some(now + chrono::Duration::seconds(30))
        );
        let later = now + chrono::Duration::hours(2);
        assert_eq!(
            EnqueueOptions::new()
                .delay(Duration::from_secs(30))
                .at(later)
                .scheduled_at(now),
            Some(later)
        );
    }

    #[test]
    fn test_options_scheduled_at_out_of_range() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        // Fits in a chrono duration but not in a timestamp.
        let far = EnqueueOptions::new().delay(Duration::from_secs(10_000_000_000_000));
        assert_eq!(far.scheduled_at(now), None);
        // Does not fit in a chrono duration at all.
        let max = EnqueueOptions::new().delay(Duration::MAX);
        assert_eq!(max.scheduled_at(now), None);
    }
}
