//! Prometheus scrape endpoint.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};

/// Creates the metrics router on `path`.
pub fn router(path: &str) -> Router<AppState> {
    Router::new().route(path, get(render_metrics))
}

/// Renders the Prometheus text exposition, or 404 when metrics are disabled.
pub async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use souk_jobs::store::MemoryJobStore;
    use souk_jobs::{HealthMonitor, QueueHealthService, TracingAlertSink};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> AppState {
        let monitor = HealthMonitor::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(TracingAlertSink),
            Default::default(),
            Vec::new(),
        );
        AppState::new(Arc::new(QueueHealthService::new(Arc::new(monitor))))
    }

    async fn scrape(state: AppState) -> (StatusCode, String) {
        let response = router("/metrics")
            .with_state(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_disabled_metrics_are_404() {
        let (status, _) = scrape(state()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_renders_recorder_output() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("souk_jobs_enqueued_total", "queue" => "default").increment(2);
        });

        let (status, body) = scrape(state().with_metrics(handle)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("souk_jobs_enqueued_total{queue=\"default\"} 2"));
    }
}
