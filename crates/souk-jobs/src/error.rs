//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
///
/// The first six variants are the coordination taxonomy the dispatcher acts
/// on; the rest describe infrastructure and operator-facing failures.
#[derive(Debug, Error)]
pub enum JobError {
    /// Bad submission. Caller error, never retried.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A handler name is referenced but nothing is registered under it.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// Handler-signaled failure that should be retried per policy.
    #[error("Transient handler error: {0}")]
    TransientHandler(String),

    /// Handler-signaled failure that dead-letters the job immediately.
    #[error("Permanent handler error: {0}")]
    PermanentHandler(String),

    /// The lock store could not be reached. Callers fail closed.
    #[error("Lock store unavailable: {0}")]
    LockStoreUnavailable(String),

    /// Attempts consumed.
    #[error("Retries exhausted for job {job_id} after {attempts} attempts")]
    Exhausted { job_id: String, attempts: u32 },

    /// Job was cancelled.
    #[error("Job was cancelled")]
    Cancelled,

    /// Execution exceeded its timeout, in milliseconds.
    #[error("Job timed out after {0}ms")]
    Timeout(u64),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Invalid job state.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Shorthand for a retriable handler failure.
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::TransientHandler(message.into())
    }

    /// Shorthand for a handler failure that must not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::PermanentHandler(message.into())
    }

    /// Wraps any store failure as `LockStoreUnavailable`.
    pub fn lock_store<E: std::fmt::Display>(err: E) -> Self {
        JobError::LockStoreUnavailable(err.to_string())
    }

    /// Returns true if a failed execution with this error may be retried.
    ///
    /// Everything a handler can produce is retriable except an explicit
    /// permanent failure or a payload that cannot be decoded.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::PermanentHandler(_)
                | JobError::InvalidJob(_)
                | JobError::HandlerNotFound(_)
                | JobError::Serialization(_)
                | JobError::Exhausted { .. }
        )
    }

    /// Returns true if this failure consumes one of the job's attempts.
    ///
    /// Infrastructure outages are not the job's fault.
    pub fn counts_as_attempt(&self) -> bool {
        !matches!(self, JobError::LockStoreUnavailable(_))
    }

    /// Returns true if the job should go straight to the dead letter set.
    pub fn should_dead_letter(&self) -> bool {
        !self.is_retryable()
    }
}

impl From<souk_core::SoukError> for JobError {
    fn from(err: souk_core::SoukError) -> Self {
        JobError::Internal(err.to_string())
    }
}

impl From<JobError> for souk_core::SoukError {
    fn from(err: JobError) -> Self {
        use souk_core::SoukError;
        match err {
            JobError::InvalidJob(msg) => SoukError::Validation(msg),
            JobError::HandlerNotFound(name) => {
                SoukError::Configuration(format!("handler not registered: {}", name))
            }
            JobError::NotFound(id) => SoukError::not_found("Job", id),
            JobError::InvalidState { .. } => SoukError::Conflict(err.to_string()),
            JobError::Configuration(msg) => SoukError::Configuration(msg),
            JobError::LockStoreUnavailable(msg) => SoukError::Unavailable(msg),
            JobError::Redis(_) | JobError::Pool(_) => SoukError::Store(err.to_string()),
            JobError::Timeout(_) => SoukError::Timeout(err.to_string()),
            other => SoukError::Internal(other.to_string()),
        }
    }
}
