//! Health check controller.
//!
//! Every route here is read-only; sampling a queue never changes it.

use crate::responses::{ApiResult, AppError};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use souk_core::SoukError;
use souk_jobs::{Alert, QueueHealthReport, QueuesHealth};
use tracing::warn;
use utoipa::ToSchema;

/// Liveness response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Health status.
    pub status: String,
    /// Application version.
    pub version: String,
}

/// One threshold breach.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AlertResponse {
    /// waiting_count, oldest_waiting_age, failed_count or no_workers.
    pub kind: String,
    /// warning or critical.
    pub severity: String,
    pub message: String,
    /// Observed value.
    pub value: u64,
    /// Threshold that was crossed.
    pub threshold: u64,
    pub raised_at: DateTime<Utc>,
}

impl From<Alert> for AlertResponse {
    fn from(alert: Alert) -> Self {
        Self {
            kind: alert.kind.as_str().to_string(),
            severity: alert.severity.as_str().to_string(),
            message: alert.message,
            value: alert.value,
            threshold: alert.threshold,
            raised_at: alert.raised_at,
        }
    }
}

/// Health of a single queue.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct QueueHealthResponse {
    pub queue_name: String,
    /// healthy, warning or critical.
    pub status: String,
    pub waiting_count: u64,
    pub active_count: u64,
    pub failed_count: u64,
    pub delayed_count: u64,
    pub completed_count: u64,
    /// Workers with a live heartbeat.
    pub worker_count: u64,
    /// Age of the longest-waiting job in seconds, absent when nothing waits.
    pub oldest_waiting_age_secs: Option<u64>,
    pub sampled_at: DateTime<Utc>,
    pub alerts: Vec<AlertResponse>,
}

impl From<QueueHealthReport> for QueueHealthResponse {
    fn from(report: QueueHealthReport) -> Self {
        let snapshot = report.snapshot;
        Self {
            queue_name: snapshot.queue_name,
            status: report.status.as_str().to_string(),
            waiting_count: snapshot.waiting_count,
            active_count: snapshot.active_count,
            failed_count: snapshot.failed_count,
            delayed_count: snapshot.delayed_count,
            completed_count: snapshot.completed_count,
            worker_count: snapshot.worker_count,
            oldest_waiting_age_secs: snapshot.oldest_waiting_age_secs,
            sampled_at: snapshot.sampled_at,
            alerts: report.alerts.into_iter().map(AlertResponse::from).collect(),
        }
    }
}

/// Health of every known queue.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct QueuesHealthResponse {
    /// Worst status among `queues`.
    pub status: String,
    pub queues: Vec<QueueHealthResponse>,
}

impl From<QueuesHealth> for QueuesHealthResponse {
    fn from(health: QueuesHealth) -> Self {
        Self {
            status: health.status.as_str().to_string(),
            queues: health
                .queues
                .into_iter()
                .map(QueueHealthResponse::from)
                .collect(),
        }
    }
}

/// Creates the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .route("/health/queues", get(all_queues_health))
        .route("/health/queue/:name", get(queue_health))
}

/// Liveness check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Process is alive", body = HealthResponse)
    )
)]
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check endpoint.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Backing store answers", body = HealthResponse),
        (status = 503, description = "Backing store unreachable", body = HealthResponse)
    )
)]
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION").to_string();
    match state.queue_health.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ready".to_string(),
                version,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable".to_string(),
                    version,
                }),
            )
        }
    }
}

/// Aggregate health across all queues.
#[utoipa::path(
    get,
    path = "/health/queues",
    tag = "health",
    responses(
        (status = 200, description = "Snapshot and alerts for every queue", body = QueuesHealthResponse),
        (status = 500, description = "Store error", body = souk_core::ErrorResponse)
    )
)]
pub async fn all_queues_health(State(state): State<AppState>) -> ApiResult<QueuesHealthResponse> {
    let health = state.queue_health.all_queues_health().await?;
    Ok(Json(health.into()))
}

/// Health of a single queue.
#[utoipa::path(
    get,
    path = "/health/queue/{name}",
    tag = "health",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 200, description = "Snapshot and alerts for the queue", body = QueueHealthResponse),
        (status = 404, description = "Queue is not known", body = souk_core::ErrorResponse)
    )
)]
pub async fn queue_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<QueueHealthResponse> {
    let report = state
        .queue_health
        .queue_health(&name)
        .await?
        .ok_or_else(|| AppError(SoukError::not_found("queue", &name)))?;
    Ok(Json(report.into()))
}

#[cfg(test)]
mod tests {
    use crate::router::create_router;
    use crate::state::AppState;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use souk_config::ServerConfig;
    use souk_jobs::config::HealthConfig;
    use souk_jobs::store::MemoryJobStore;
    use souk_jobs::{
        EnqueueOptions, HealthMonitor, JobError, JobResult, QueueHealthInterface,
        QueueHealthReport, QueueHealthService, QueuesHealth, TracingAlertSink,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state_with(store: Arc<MemoryJobStore>) -> AppState {
        let monitor = HealthMonitor::new(
            store,
            Arc::new(TracingAlertSink),
            HealthConfig::default(),
            vec!["default".to_string()],
        );
        AppState::new(Arc::new(QueueHealthService::new(Arc::new(monitor))))
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, Value) {
        let app = create_router(state, &ServerConfig::default(), "/metrics");
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    struct DownStore;

    #[async_trait]
    impl QueueHealthInterface for DownStore {
        async fn queue_names(&self) -> JobResult<Vec<String>> {
            Err(JobError::lock_store("connection refused"))
        }

        async fn queue_health(&self, _queue: &str) -> JobResult<Option<QueueHealthReport>> {
            Err(JobError::lock_store("connection refused"))
        }

        async fn all_queues_health(&self) -> JobResult<QueuesHealth> {
            Err(JobError::lock_store("connection refused"))
        }

        async fn ping(&self) -> JobResult<()> {
            Err(JobError::lock_store("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = get(state_with(Arc::new(MemoryJobStore::new())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_readiness_reflects_store() {
        let (status, body) =
            get(state_with(Arc::new(MemoryJobStore::new())), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");

        let (status, body) = get(AppState::new(Arc::new(DownStore)), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unavailable");
    }

    #[tokio::test]
    async fn test_unknown_queue_is_404() {
        let (status, body) = get(
            state_with(Arc::new(MemoryJobStore::new())),
            "/health/queue/missing",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_waiting_jobs_without_workers_are_critical() {
        let store = Arc::new(MemoryJobStore::new());
        let state = state_with(store.clone());

        let dispatcher = souk_jobs::Dispatcher::new(
            store,
            Arc::new(souk_jobs::LockManager::new(
                Arc::new(souk_jobs::store::MemoryLockStore::new()),
                souk_jobs::StoreKeys::new("souk"),
                Default::default(),
            )),
            Arc::new(souk_jobs::IdempotencyGuard::new(
                Arc::new(souk_jobs::store::MemoryLockStore::new()),
                souk_jobs::StoreKeys::new("souk"),
                &Default::default(),
            )),
            Default::default(),
        );
        dispatcher.register_fn("send_email", |_ctx, payload| async move { Ok(payload) });
        dispatcher
            .enqueue(
                "default",
                "send_email",
                json!({ "to": "ops@example.com" }),
                EnqueueOptions::new(),
            )
            .await
            .unwrap();

        let (status, body) = get(state.clone(), "/health/queue/default").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue_name"], "default");
        assert_eq!(body["waiting_count"], 1);
        assert_eq!(body["worker_count"], 0);
        assert_eq!(body["status"], "critical");
        assert_eq!(body["alerts"][0]["kind"], "no_workers");

        let (status, body) = get(state, "/health/queues").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "critical");
        assert_eq!(body["queues"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_server_error() {
        let (status, body) = get(AppState::new(Arc::new(DownStore)), "/health/queues").await;
        assert!(status.is_server_error());
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_openapi_document_lists_health_paths() {
        let (status, body) = get(
            state_with(Arc::new(MemoryJobStore::new())),
            "/api-docs/openapi.json",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/health/queues"].is_object());
        assert!(body["paths"]["/health/queue/{name}"].is_object());
    }
}
