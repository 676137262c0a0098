//! Souk Jobs - Background Job Coordination
//!
//! A Redis-backed coordination core for background work:
//! - Queues with per-queue concurrency, priorities and delayed jobs
//! - Distributed, TTL-bounded locks with auto-renewal
//! - Idempotency guard for exactly-once effects over at-least-once delivery
//! - Fixed and exponential backoff with jitter
//! - Dead letters with explicit operator requeue
//! - Queue health sampling and threshold alerts
//! - Cron scheduling with leader election
//!
//! # Architecture
//!
//! ```text
//!  Producer ──enqueue──► JobStore (waiting / delayed, per priority tier)
//!                              │
//!                              │ claim (atomic)
//!                              ▼
//!  Dispatcher worker ──► LockManager ──► IdempotencyGuard ──► handler
//!          │                                                    │
//!          │◄────────────────────── result ─────────────────────┘
//!          ▼
//!   completed │ delayed (backoff) │ failed (dead letter)
//!
//!  HealthMonitor ── samples JobStore ──► evaluate ──► AlertSink
//!  Scheduler ── leader lock ──► enqueue with cron dedupe key
//! ```
//!
//! All shared state lives in the store; any number of processes can run
//! dispatchers against the same Redis.
//!
//! # Example
//!
//! ```rust,ignore
//! use souk_jobs::{Dispatcher, EnqueueOptions, JobError};
//! use serde_json::json;
//!
//! dispatcher.register_fn("sync_stock", |ctx, payload| async move {
//!     let sku = payload["sku"].as_str().ok_or_else(|| JobError::permanent("missing sku"))?;
//!     // talk to the carrier...
//!     Ok(json!({ "sku": sku, "attempt": ctx.attempt }))
//! });
//!
//! dispatcher
//!     .enqueue(
//!         "inventory",
//!         "sync_stock",
//!         json!({ "sku": "sku_42" }),
//!         EnqueueOptions::new().resource_lock("sku_42"),
//!     )
//!     .await?;
//! ```

pub mod config;
pub mod di;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod health;
pub mod idempotency;
pub mod job;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod redis;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use config::JobsConfig;
pub use di::{QueueHealthInterface, QueueHealthService, QueuesHealth};
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use error::{JobError, JobResult};
pub use handler::{FnHandler, HandlerContext, HandlerRegistry, JobHandler};
pub use health::{
    evaluate, Alert, AlertKind, AlertSeverity, AlertSink, HealthMonitor, HealthStatus,
    QueueHealthReport, QueueHealthSnapshot, TracingAlertSink,
};
pub use idempotency::{
    IdempotencyClaim, IdempotencyGuard, IdempotencyRecord, IdempotencyStatus, IdempotentOutcome,
};
pub use job::{EnqueueOptions, Job, JobId, JobRecord, JobState, Priority};
pub use keys::StoreKeys;
pub use lock::{KeepAlive, LockLease, LockManager};
pub use metrics::{register_metrics, HealthMetrics, JobMetrics, LockMetrics, SchedulerMetrics};
pub use retry::{BackoffKind, BackoffPolicy, RetryDecision};
pub use scheduler::{cron_expressions, ScheduledJob, ScheduledJobInfo, Scheduler, SchedulerStats};
pub use store::{InsertOutcome, JobStore, LockStore, RetentionPolicy, StateCounts};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::handler::{HandlerContext, JobHandler};
    pub use crate::job::{EnqueueOptions, Job, Priority};
    pub use crate::retry::BackoffPolicy;
    pub use crate::{JobError, JobId, JobResult};
}
