//! Queue health monitoring and alerting.
//!
//! [`HealthMonitor::tick`] samples every queue, keeps the latest
//! [`QueueHealthSnapshot`] per queue and runs [`evaluate`] against the
//! configured [`HealthThresholds`]. Alerts go to an [`AlertSink`]; delivery to
//! paging or chat systems lives outside this crate.

use crate::config::{HealthConfig, HealthThresholds};
use crate::error::JobResult;
use crate::metrics::{HealthMetrics, JobMetrics};
use crate::store::{JobStore, StateCounts};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealthSnapshot {
    pub queue_name: String,
    pub waiting_count: u64,
    pub active_count: u64,
    pub failed_count: u64,
    pub delayed_count: u64,
    pub completed_count: u64,
    /// Workers with a live heartbeat.
    pub worker_count: u64,
    /// Age of the longest-waiting eligible job in seconds.
    pub oldest_waiting_age_secs: Option<u64>,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    WaitingCount,
    OldestWaitingAge,
    FailedCount,
    NoWorkers,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::WaitingCount => "waiting_count",
            AlertKind::OldestWaitingAge => "oldest_waiting_age",
            AlertKind::FailedCount => "failed_count",
            AlertKind::NoWorkers => "no_workers",
        }
    }
}

/// A threshold breach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub queue_name: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    /// Observed value.
    pub value: u64,
    /// Threshold that was crossed.
    pub threshold: u64,
    pub raised_at: DateTime<Utc>,
}

/// Overall status of one queue or a set of queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Worst severity among `alerts`.
    pub fn from_alerts(alerts: &[Alert]) -> Self {
        match alerts.iter().map(|a| a.severity).max() {
            None => HealthStatus::Healthy,
            Some(AlertSeverity::Warning) => HealthStatus::Warning,
            Some(AlertSeverity::Critical) => HealthStatus::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Snapshot plus its evaluated alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealthReport {
    pub status: HealthStatus,
    pub snapshot: QueueHealthSnapshot,
    pub alerts: Vec<Alert>,
}

/// Compares a snapshot against thresholds.
///
/// Jobs waiting with no live worker is always critical, whatever the counts.
pub fn evaluate(snapshot: &QueueHealthSnapshot, thresholds: &HealthThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let mut check = |kind: AlertKind, value: u64, warning: Option<u64>, critical: Option<u64>, what: &str| {
        let breach = match (critical, warning) {
            (Some(c), _) if value >= c => Some((AlertSeverity::Critical, c)),
            (_, Some(w)) if value >= w => Some((AlertSeverity::Warning, w)),
            _ => None,
        };
        if let Some((severity, threshold)) = breach {
            alerts.push(Alert {
                queue_name: snapshot.queue_name.clone(),
                kind,
                severity,
                message: format!(
                    "queue {} {} is {} (threshold {})",
                    snapshot.queue_name, what, value, threshold
                ),
                value,
                threshold,
                raised_at: snapshot.sampled_at,
            });
        }
    };

    check(
        AlertKind::WaitingCount,
        snapshot.waiting_count,
        Some(thresholds.warning_waiting),
        Some(thresholds.critical_waiting),
        "waiting count",
    );
    if let Some(age) = snapshot.oldest_waiting_age_secs {
        check(
            AlertKind::OldestWaitingAge,
            age,
            Some(thresholds.warning_age_secs),
            Some(thresholds.critical_age_secs),
            "oldest waiting age (s)",
        );
    }
    check(
        AlertKind::FailedCount,
        snapshot.failed_count,
        thresholds.warning_failed,
        thresholds.critical_failed,
        "failed count",
    );

    if snapshot.waiting_count > 0 && snapshot.worker_count == 0 {
        alerts.push(Alert {
            queue_name: snapshot.queue_name.clone(),
            kind: AlertKind::NoWorkers,
            severity: AlertSeverity::Critical,
            message: format!(
                "queue {} has {} waiting jobs and no live workers",
                snapshot.queue_name, snapshot.waiting_count
            ),
            value: snapshot.waiting_count,
            threshold: 0,
            raised_at: snapshot.sampled_at,
        });
    }

    alerts
}

/// Destination for health alerts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: Alert) -> JobResult<()>;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: Alert) -> JobResult<()> {
        match alert.severity {
            AlertSeverity::Warning => warn!(
                queue = %alert.queue_name,
                kind = alert.kind.as_str(),
                value = alert.value,
                threshold = alert.threshold,
                "{}",
                alert.message
            ),
            AlertSeverity::Critical => error!(
                queue = %alert.queue_name,
                kind = alert.kind.as_str(),
                value = alert.value,
                threshold = alert.threshold,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Periodic sampler of queue state.
pub struct HealthMonitor {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn AlertSink>,
    config: HealthConfig,
    configured_queues: Vec<String>,
    latest: RwLock<HashMap<String, QueueHealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        sink: Arc<dyn AlertSink>,
        config: HealthConfig,
        configured_queues: Vec<String>,
    ) -> Self {
        Self {
            store,
            sink,
            config,
            configured_queues,
            latest: RwLock::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.config.thresholds
    }

    /// Configured queues plus every queue the store has seen, sorted.
    pub async fn queues(&self) -> JobResult<Vec<String>> {
        let mut names: BTreeSet<String> = self.configured_queues.iter().cloned().collect();
        names.extend(self.store.known_queues().await?);
        Ok(names.into_iter().collect())
    }

    pub async fn is_known(&self, queue: &str) -> JobResult<bool> {
        Ok(self.queues().await?.iter().any(|q| q == queue))
    }

    /// Reads the current state of `queue`. Read-only.
    pub async fn snapshot(&self, queue: &str) -> JobResult<QueueHealthSnapshot> {
        let now = Utc::now();
        let counts = self.store.counts(queue, now).await?;
        let oldest = self.store.oldest_waiting(queue, now).await?;
        let worker_count = self.store.live_workers(queue, now).await?;

        Ok(QueueHealthSnapshot {
            queue_name: queue.to_string(),
            waiting_count: counts.waiting,
            active_count: counts.active,
            failed_count: counts.failed,
            delayed_count: counts.delayed,
            completed_count: counts.completed,
            worker_count,
            oldest_waiting_age_secs: oldest
                .map(|at| (now - at).num_seconds().max(0) as u64),
            sampled_at: now,
        })
    }

    pub async fn snapshot_all(&self) -> JobResult<Vec<QueueHealthSnapshot>> {
        let mut snapshots = Vec::new();
        for queue in self.queues().await? {
            snapshots.push(self.snapshot(&queue).await?);
        }
        Ok(snapshots)
    }

    /// Snapshot of `queue` with its alerts evaluated. Emits nothing.
    pub async fn report(&self, queue: &str) -> JobResult<QueueHealthReport> {
        let snapshot = self.snapshot(queue).await?;
        let alerts = evaluate(&snapshot, &self.config.thresholds);
        Ok(QueueHealthReport {
            status: HealthStatus::from_alerts(&alerts),
            snapshot,
            alerts,
        })
    }

    pub async fn report_all(&self) -> JobResult<Vec<QueueHealthReport>> {
        let mut reports = Vec::new();
        for queue in self.queues().await? {
            reports.push(self.report(&queue).await?);
        }
        Ok(reports)
    }

    /// Most recent snapshot taken by [`tick`](Self::tick).
    pub fn latest(&self, queue: &str) -> Option<QueueHealthSnapshot> {
        self.latest.read().get(queue).cloned()
    }

    pub async fn ping(&self) -> JobResult<()> {
        self.store.ping().await
    }

    /// Samples every queue, records gauges and emits alerts.
    pub async fn tick(&self) -> JobResult<Vec<Alert>> {
        let mut raised = Vec::new();

        for queue in self.queues().await? {
            let snapshot = match self.snapshot(&queue).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to sample queue");
                    continue;
                }
            };

            JobMetrics::update_queue_depth(
                &queue,
                &StateCounts {
                    waiting: snapshot.waiting_count,
                    delayed: snapshot.delayed_count,
                    active: snapshot.active_count,
                    completed: snapshot.completed_count,
                    failed: snapshot.failed_count,
                },
            );

            let alerts = evaluate(&snapshot, &self.config.thresholds);
            debug!(queue = %queue, alerts = alerts.len(), "Sampled queue");
            self.latest.write().insert(queue.clone(), snapshot);

            for alert in alerts {
                HealthMetrics::alert_raised(&queue, alert.kind.as_str(), alert.severity.as_str());
                if let Err(e) = self.sink.emit(alert.clone()).await {
                    warn!(queue = %queue, error = %e, "Failed to emit alert");
                }
                raised.push(alert);
            }
        }

        Ok(raised)
    }

    /// Ticks every `interval` until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.config.interval_secs, "Starting health monitor");
        let mut interval = tokio::time::interval(self.config.interval());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Health tick failed");
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::job::{JobId, JobRecord, JobState, Priority};
    use crate::retry::BackoffPolicy;
    use crate::store::MemoryJobStore;
    use serde_json::json;
    use std::time::Duration;

    fn snapshot(waiting: u64, age: Option<u64>, failed: u64, workers: u64) -> QueueHealthSnapshot {
        QueueHealthSnapshot {
            queue_name: "translations".into(),
            waiting_count: waiting,
            active_count: 0,
            failed_count: failed,
            delayed_count: 0,
            completed_count: 0,
            worker_count: workers,
            oldest_waiting_age_secs: age,
            sampled_at: Utc::now(),
        }
    }

    fn kinds(alerts: &[Alert]) -> Vec<(AlertKind, AlertSeverity)> {
        alerts.iter().map(|a| (a.kind, a.severity)).collect()
    }

    fn pending(queue: &str, scheduled_at: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: JobId::new(),
            queue: queue.into(),
            handler: "translate".into(),
            payload: json!({}),
            state: JobState::Waiting,
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
    fn test_healthy_queue_has_no_alerts() {
        let alerts = evaluate(&snapshot(10, Some(30), 0, 2), &HealthThresholds::default());
        assert!(alerts.is_empty());
        assert_eq!(HealthStatus::from_alerts(&alerts), HealthStatus::Healthy);
    }

    #[test]
    fn test_waiting_thresholds() {
        let thresholds = HealthThresholds::default();

        let alerts = evaluate(&snapshot(1_000, None, 0, 1), &thresholds);
        assert_eq!(kinds(&alerts), vec![(AlertKind::WaitingCount, AlertSeverity::Warning)]);
        assert_eq!(alerts[0].threshold, 1_000);

        let alerts = evaluate(&snapshot(5_000, None, 0, 1), &thresholds);
        assert_eq!(kinds(&alerts), vec![(AlertKind::WaitingCount, AlertSeverity::Critical)]);
        assert_eq!(HealthStatus::from_alerts(&alerts), HealthStatus::Critical);
    }

    #[test]
    fn test_age_thresholds() {
        let thresholds = HealthThresholds::default();

        let alerts = evaluate(&snapshot(1, Some(3_600), 0, 1), &thresholds);
        assert_eq!(
            kinds(&alerts),
            vec![(AlertKind::OldestWaitingAge, AlertSeverity::Warning)]
        );

        let alerts = evaluate(&snapshot(1, Some(6 * 3_600), 0, 1), &thresholds);
        assert_eq!(
            kinds(&alerts),
            vec![(AlertKind::OldestWaitingAge, AlertSeverity::Critical)]
        );
    }

    #[test]
    fn test_failed_thresholds_are_optional() {
        let mut thresholds = HealthThresholds::default();
        assert!(evaluate(&snapshot(0, None, 50_000, 1), &thresholds).is_empty());

        thresholds.warning_failed = Some(10);
        thresholds.critical_failed = Some(100);
        let alerts = evaluate(&snapshot(0, None, 10, 1), &thresholds);
        assert_eq!(kinds(&alerts), vec![(AlertKind::FailedCount, AlertSeverity::Warning)]);
    }

    #[test]
    fn test_no_workers_is_always_critical() {
        let alerts = evaluate(&snapshot(1, Some(0), 0, 0), &HealthThresholds::default());
        assert_eq!(kinds(&alerts), vec![(AlertKind::NoWorkers, AlertSeverity::Critical)]);

        // An idle queue without workers is fine.
        assert!(evaluate(&snapshot(0, None, 0, 0), &HealthThresholds::default()).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_reads_store() {
        let store = Arc::new(MemoryJobStore::new());
        let now = Utc::now();
        store
            .insert(&pending("translations", now - chrono::Duration::hours(2)))
            .await
            .unwrap();
        store.insert(&pending("translations", now)).await.unwrap();
        store
            .heartbeat("translations", "w-1", Duration::from_secs(30))
            .await
            .unwrap();

        let monitor = HealthMonitor::new(
            store,
            Arc::new(TracingAlertSink),
            HealthConfig::default(),
            vec![],
        );
        let snap = monitor.snapshot("translations").await.unwrap();
        assert_eq!(snap.waiting_count, 2);
        assert_eq!(snap.worker_count, 1);
        assert!(snap.oldest_waiting_age_secs.unwrap() >= 7_200);

        let report = monitor.report("translations").await.unwrap();
        assert_eq!(report.status, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_tick_emits_alerts_and_keeps_latest() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .insert(&pending("webhooks", Utc::now()))
            .await
            .unwrap();

        let mut sink = MockAlertSink::new();
        sink.expect_emit()
            .withf(|alert| alert.kind == AlertKind::NoWorkers && alert.queue_name == "webhooks")
            .times(1)
            .returning(|_| Ok(()));

        let monitor = HealthMonitor::new(
            store,
            Arc::new(sink),
            HealthConfig::default(),
            vec!["default".into()],
        );
        assert!(monitor.latest("webhooks").is_none());

        let alerts = monitor.tick().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(monitor.latest("webhooks").unwrap().waiting_count, 1);
        // Configured queues are sampled even when empty.
        assert_eq!(monitor.latest("default").unwrap().waiting_count, 0);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_abort_tick() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(&pending("a", Utc::now())).await.unwrap();
        store.insert(&pending("b", Utc::now())).await.unwrap();

        let mut sink = MockAlertSink::new();
        sink.expect_emit()
            .times(2)
            .returning(|_| Err(JobError::Internal("pager down".into())));

        let monitor = HealthMonitor::new(store, Arc::new(sink), HealthConfig::default(), vec![]);
        assert_eq!(monitor.tick().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_queues_merges_configured_and_known() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(&pending("sitemaps", Utc::now())).await.unwrap();

        let monitor = HealthMonitor::new(
            store,
            Arc::new(TracingAlertSink),
            HealthConfig::default(),
            vec!["currency".into()],
        );
        assert_eq!(monitor.queues().await.unwrap(), vec!["currency", "sitemaps"]);
        assert!(monitor.is_known("sitemaps").await.unwrap());
        assert!(!monitor.is_known("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let monitor = Arc::new(HealthMonitor::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(TracingAlertSink),
            HealthConfig::default(),
            vec!["default".into()],
        ));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&monitor).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(monitor.latest("default").is_some());
    }
}
