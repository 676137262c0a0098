//! Application state for Axum handlers.

use metrics_exporter_prometheus::PrometheusHandle;
use souk_jobs::QueueHealthInterface;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub queue_health: Arc<dyn QueueHealthInterface>,
    /// Present when the Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(queue_health: Arc<dyn QueueHealthInterface>) -> Self {
        Self {
            queue_health,
            metrics: None,
        }
    }

    /// Serves `handle` on the metrics route.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
