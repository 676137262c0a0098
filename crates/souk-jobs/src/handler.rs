//! Handler registration.
//!
//! Handlers are looked up by name when a job is dispatched. Registration is
//! done up front and [`HandlerRegistry::ensure_registered`] lets the process
//! fail at startup when configuration names a handler nobody registered.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Execution context passed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: JobId,
    pub queue: String,
    pub handler: String,
    /// 1-based number of this execution.
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub worker_id: String,
    /// Resource lock held for the duration of this execution.
    pub lock_key: Option<String>,
    /// Cancelled on shutdown, timeout, or loss of the resource lock.
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the handler should stop.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// `Err(JobError::Cancelled)` once the handler should stop, for use with
    /// `?` between steps of a long handler. The attempt is retried.
    pub fn check_cancelled(&self) -> JobResult<()> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A registered job handler.
///
/// Return `JobError::PermanentHandler` to dead-letter the job immediately;
/// every other error is retried per the job's backoff policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, payload: Value) -> JobResult<Value>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, payload: Value) -> JobResult<Value> {
        (self.0)(ctx, payload).await
    }
}

/// Decodes the payload into `J` and runs [`Job::execute`].
struct JobAdapter<J>(PhantomData<fn() -> J>);

#[async_trait]
impl<J: Job> JobHandler for JobAdapter<J> {
    async fn handle(&self, ctx: HandlerContext, payload: Value) -> JobResult<Value> {
        let job: J = serde_json::from_value(payload).map_err(|e| {
            JobError::permanent(format!("payload does not decode as {}: {}", J::NAME, e))
        })?;
        job.execute(ctx).await
    }
}

/// Name to handler table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any earlier registration.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        let replaced = self.handlers.write().insert(name.clone(), handler).is_some();
        info!(handler = %name, replaced, "Registered job handler");
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)));
    }

    /// Registers a typed job under [`Job::NAME`].
    pub fn register_job<J: Job>(&self) {
        self.register(J::NAME, Arc::new(JobAdapter::<J>(PhantomData)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Fails with `HandlerNotFound` for the first name that is not registered.
    pub fn ensure_registered<I, S>(&self, names: I) -> JobResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let handlers = self.handlers.read();
        for name in names {
            let name = name.as_ref();
            if !handlers.contains_key(name) {
                return Err(JobError::HandlerNotFound(name.to_string()));
            }
        }
        Ok(())
    }
}
