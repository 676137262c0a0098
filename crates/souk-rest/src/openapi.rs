//! OpenAPI documentation configuration.

use crate::controllers::health_controller::{
    AlertResponse, HealthResponse, QueueHealthResponse, QueuesHealthResponse,
};
use souk_core::ErrorResponse;
use utoipa::OpenApi;

/// OpenAPI documentation for the Souk health API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Souk Queue Health API",
        version = "1.0.0",
        description = "Read-only health of Souk job queues",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    paths(
        crate::controllers::health_controller::health_check,
        crate::controllers::health_controller::readiness_check,
        crate::controllers::health_controller::all_queues_health,
        crate::controllers::health_controller::queue_health,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            AlertResponse,
            QueueHealthResponse,
            QueuesHealthResponse,
        )
    ),
    tags(
        (name = "health", description = "Liveness, readiness and queue health")
    )
)]
pub struct ApiDoc;
