//! Application builder.

use crate::di::{build_redis_components, AppComponents};
use crate::startup::print_startup_info;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use souk_config::AppConfig;
use souk_core::{SoukError, SoukResult};
use souk_jobs::{register_metrics, Dispatcher};
use souk_rest::{create_router, AppState};
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type Registration = Box<dyn FnOnce(&Dispatcher) + Send>;

/// Application builder for constructing the worker process.
pub struct AppBuilder {
    config: Option<AppConfig>,
    registrations: Vec<Registration>,
}

impl AppBuilder {
    /// Creates a new application builder.
    pub fn new() -> Self {
        Self {
            config: None,
            registrations: Vec::new(),
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Registers handlers on the dispatcher before it starts.
    pub fn with_handlers<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&Dispatcher) + Send + 'static,
    {
        self.registrations.push(Box::new(register));
        self
    }

    /// Connects to Redis, starts every component and serves HTTP until
    /// `shutdown` resolves.
    pub async fn run<S>(self, shutdown: S) -> SoukResult<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let config = self.config.unwrap_or_default();

        let metrics = if config.observability.metrics_enabled {
            Some(install_metrics_recorder()?)
        } else {
            None
        };

        let components = build_redis_components(&config.jobs).await?;
        for register in self.registrations {
            register(&components.dispatcher);
        }
        components.dispatcher.validate_handlers()?;

        serve(config, components, metrics, shutdown).await
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn install_metrics_recorder() -> SoukResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| SoukError::Internal(format!("Failed to install metrics recorder: {}", e)))?;
    register_metrics();
    Ok(handle)
}

/// Runs the components and the HTTP server until `shutdown` resolves, then
/// drains in order: HTTP, scheduler and monitor, then the dispatcher.
pub async fn serve<S>(
    config: AppConfig,
    components: AppComponents,
    metrics: Option<PrometheusHandle>,
    shutdown: S,
) -> SoukResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let background = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let dispatcher = components.dispatcher.clone();
    let dispatcher_token = background.clone();
    let dispatcher_task = tokio::spawn(async move {
        let result = dispatcher.run().await;
        if let Err(ref e) = result {
            error!(error = %e, "Dispatcher stopped with an error");
            dispatcher_token.cancel();
        }
        result
    });

    if config.jobs.health.enabled {
        let monitor = components.monitor.clone();
        tasks.push(tokio::spawn(monitor.run(background.clone())));
    }

    if let Some(scheduler) = components.scheduler.clone() {
        let token = background.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run(token).await {
                error!(error = %e, "Scheduler stopped with an error");
            }
        }));
    }

    let mut state = AppState::new(components.queue_health.clone());
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }
    let router = create_router(state, &config.server, &config.observability.metrics_path);

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SoukError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    print_startup_info(&addr, &config);

    let http_token = background.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown => {}
                _ = http_token.cancelled() => {}
            }
        })
        .await
        .map_err(|e| SoukError::Internal(format!("HTTP server error: {}", e)));

    info!("HTTP server stopped, draining workers");
    background.cancel();
    components.dispatcher.stop();

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    match dispatcher_task.await {
        Ok(result) => result?,
        Err(e) => return Err(SoukError::Internal(format!("Dispatcher task failed: {}", e))),
    }

    served?;
    info!("Server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::di::build_components;
    use serde_json::json;
    use souk_jobs::store::{MemoryJobStore, MemoryLockStore};
    use souk_jobs::{EnqueueOptions, JobState, TracingAlertSink};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_app_builder_default() {
        let builder = AppBuilder::default();
        assert!(builder.config.is_none());
        assert!(builder.registrations.is_empty());
    }

    #[test]
    fn test_app_builder_collects_registrations() {
        let builder = AppBuilder::new()
            .with_config(AppConfig::default())
            .with_handlers(|d| d.register_fn("a", |_ctx, p| async move { Ok(p) }))
            .with_handlers(|d| d.register_fn("b", |_ctx, p| async move { Ok(p) }));
        assert!(builder.config.is_some());
        assert_eq!(builder.registrations.len(), 2);
    }

    #[tokio::test]
    async fn test_serve_runs_jobs_and_shuts_down() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        config.jobs.dispatcher.poll_interval_ms = 10;
        config.jobs.scheduler.enabled = false;

        let components = build_components(
            Arc::new(MemoryLockStore::new()),
            Arc::new(MemoryJobStore::new()),
            Arc::new(TracingAlertSink),
            &config.jobs,
        )
        .unwrap();
        components
            .dispatcher
            .register_fn("echo", |_ctx, payload| async move { Ok(payload) });
        let dispatcher = components.dispatcher.clone();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(config, components, None, async move {
            let _ = rx.await;
        }));

        let id = dispatcher
            .enqueue("default", "echo", json!({ "n": 1 }), EnqueueOptions::new())
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = dispatcher.job("default", &id).await.unwrap().unwrap();
            if job.state == JobState::Completed {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!dispatcher.is_running());
    }
}
