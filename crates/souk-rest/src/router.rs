//! Main application router.

use crate::{
    controllers::{health_controller, metrics_controller},
    middleware::logging_middleware,
    openapi::ApiDoc,
    state::AppState,
};
use axum::{http::HeaderValue, middleware, routing::get, Router};
use souk_config::ServerConfig;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Creates the application router.
///
/// `metrics_path` is served only when `state` carries a Prometheus handle.
pub fn create_router(state: AppState, server_config: &ServerConfig, metrics_path: &str) -> Router {
    let cors = create_cors_layer(server_config);

    let router = Router::new()
        .merge(health_controller::router())
        .merge(metrics_controller::router(metrics_path))
        .route("/", get(root))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TimeoutLayer::new(server_config.request_timeout()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(logging_middleware));

    info!("Router created with health endpoints and Swagger UI at /swagger-ui");
    router
}

/// Creates a CORS layer based on server configuration.
fn create_cors_layer(server_config: &ServerConfig) -> CorsLayer {
    if !server_config.cors_enabled {
        return CorsLayer::new();
    }
    if server_config.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = server_config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Root endpoint handler.
async fn root() -> &'static str {
    "Souk queue health API"
}
