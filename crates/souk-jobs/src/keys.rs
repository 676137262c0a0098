//! Key naming for the shared key-value store.

use crate::job::{JobState, Priority};

/// Key builder.
///
/// Every key lives under a configurable prefix so several deployments can
/// share one store.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Lock on a logical resource.
    pub fn lock(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }

    /// Idempotency record.
    pub fn idempotency(&self, key: &str) -> String {
        format!("{}:idempotency:{}", self.prefix, key)
    }

    /// Job record.
    pub fn job(&self, queue: &str, job_id: &str) -> String {
        format!("{}{}", self.job_prefix(queue), job_id)
    }

    /// Prefix of every job record in a queue.
    pub fn job_prefix(&self, queue: &str) -> String {
        format!("{}:queue:{}:job:", self.prefix, queue)
    }

    /// Pending jobs of one priority tier (sorted set scored by scheduled time).
    pub fn pending(&self, queue: &str, priority: Priority) -> String {
        format!("{}:queue:{}:pending:{}", self.prefix, queue, priority)
    }

    /// Index of jobs in a non-pending state (sorted set scored by transition time).
    pub fn state_index(&self, queue: &str, state: JobState) -> String {
        format!("{}:queue:{}:{}", self.prefix, queue, state)
    }

    /// Dedupe key pointing at the job that currently owns it.
    pub fn dedupe(&self, queue: &str, key: &str) -> String {
        format!("{}:queue:{}:dedupe:{}", self.prefix, queue, key)
    }

    /// Worker heartbeats (sorted set scored by expiry).
    pub fn workers(&self, queue: &str) -> String {
        format!("{}:queue:{}:workers", self.prefix, queue)
    }

    /// Set of every queue name that has received a job.
    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Scheduler leadership lock name, passed to the lock manager.
    pub fn scheduler_leader(&self) -> &'static str {
        "scheduler:leader"
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("souk")
    }
}
