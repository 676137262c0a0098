//! Dependency injection interfaces for the jobs module.
//!
//! The HTTP layer depends on [`QueueHealthInterface`] rather than on the
//! monitor and store directly, so it can be served from a Shaku module or a
//! test double.

use crate::error::JobResult;
use crate::health::{HealthMonitor, HealthStatus, QueueHealthReport};
use async_trait::async_trait;
use serde::Serialize;
use souk_core::Interface;
use std::sync::Arc;

/// Health reports across every queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueuesHealth {
    /// Worst status among `queues`.
    pub status: HealthStatus,
    pub queues: Vec<QueueHealthReport>,
}

/// Read-only queue health operations.
#[async_trait]
pub trait QueueHealthInterface: Interface + Send + Sync {
    /// Names of every queue the monitor reports on.
    async fn queue_names(&self) -> JobResult<Vec<String>>;

    /// Report for one queue, `None` if the queue is unknown.
    async fn queue_health(&self, queue: &str) -> JobResult<Option<QueueHealthReport>>;

    /// Reports for every queue.
    async fn all_queues_health(&self) -> JobResult<QueuesHealth>;

    /// Checks that the backing store answers.
    async fn ping(&self) -> JobResult<()>;
}

/// [`QueueHealthInterface`] backed by a [`HealthMonitor`].
pub struct QueueHealthService {
    monitor: Arc<HealthMonitor>,
}

impl QueueHealthService {
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl QueueHealthInterface for QueueHealthService {
    async fn queue_names(&self) -> JobResult<Vec<String>> {
        self.monitor.queues().await
    }

    async fn queue_health(&self, queue: &str) -> JobResult<Option<QueueHealthReport>> {
        if !self.monitor.is_known(queue).await? {
            return Ok(None);
        }
        self.monitor.report(queue).await.map(Some)
    }

    async fn all_queues_health(&self) -> JobResult<QueuesHealth> {
        let queues = self.monitor.report_all().await?;
        let status = queues
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Ok(QueuesHealth { status, queues })
    }

    async fn ping(&self) -> JobResult<()> {
        self.monitor.ping().await
    }
}
