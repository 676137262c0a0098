//! Tracing initialization with optional OpenTelemetry export.
//!
//! Console output goes through `tracing-subscriber` with an `EnvFilter`
//! (`RUST_LOG` wins over the built-in default). When an OTLP endpoint is
//! configured, spans are additionally exported through `tracing-opentelemetry`.

#[cfg(feature = "telemetry")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "telemetry")]
use opentelemetry::KeyValue;
#[cfg(feature = "telemetry")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "telemetry")]
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler},
    Resource,
};
#[cfg(feature = "telemetry")]
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
#[cfg(feature = "telemetry")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::SoukResult;
use serde::{Deserialize, Serialize};

/// Default filter directive when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,souk=debug,tower_http=debug";

/// Console log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether OpenTelemetry export is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Service name for tracing.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP endpoint URL (e.g., "http://localhost:4317").
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Sampling ratio (0.0 to 1.0).
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,

    /// Whether to enable console output.
    #[serde(default = "default_console_output")]
    pub console_output: bool,

    /// Console output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Level for Souk crates when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_service_name() -> String {
    "souk".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_console_output() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
            otlp_endpoint: None,
            sampling_ratio: default_sampling_ratio(),
            console_output: default_console_output(),
            log_format: LogFormat::default(),
            log_level: None,
        }
    }
}

#[cfg(feature = "telemetry")]
fn env_filter(log_level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| match log_level {
        Some(level) => EnvFilter::new(format!("{level},souk={level},tower_http={level}")),
        None => EnvFilter::new(DEFAULT_FILTER),
    })
}

/// Initialize tracing with the given configuration.
///
/// This sets up:
/// - OpenTelemetry tracer with OTLP exporter (if enabled and an endpoint is configured)
/// - tracing subscriber with OpenTelemetry layer
/// - Console output layer (if enabled), pretty or JSON
#[cfg(feature = "telemetry")]
pub fn init_telemetry(config: &TelemetryConfig) -> SoukResult<()> {
    if !config.enabled {
        init_basic_tracing(config.console_output, config.log_format, config.log_level.as_deref());
        return Ok(());
    }

    let sampler = if config.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_ratio)
    };

    let resource = Resource::new(vec![KeyValue::new(
        SERVICE_NAME,
        config.service_name.clone(),
    )]);

    let tracer_provider = if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| {
                crate::SoukError::Internal(format!("Failed to create OTLP exporter: {}", e))
            })?;

        opentelemetry_sdk::trace::TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_sampler(sampler)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build()
    } else {
        opentelemetry_sdk::trace::TracerProvider::builder()
            .with_sampler(sampler)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build()
    };

    let tracer = tracer_provider.tracer("souk");
    opentelemetry::global::set_tracer_provider(tracer_provider);

    match (config.console_output, config.log_format) {
        (true, LogFormat::Json) => tracing_subscriber::registry()
            .with(env_filter(config.log_level.as_deref()))
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init(),
        (true, LogFormat::Pretty) => tracing_subscriber::registry()
            .with(env_filter(config.log_level.as_deref()))
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init(),
        (false, _) => tracing_subscriber::registry()
            .with(env_filter(config.log_level.as_deref()))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init(),
    }

    tracing::info!(
        service_name = %config.service_name,
        sampling_ratio = %config.sampling_ratio,
        otlp_endpoint = ?config.otlp_endpoint,
        "Telemetry initialized"
    );

    Ok(())
}

/// Initialize console tracing without OpenTelemetry.
#[cfg(feature = "telemetry")]
fn init_basic_tracing(console_output: bool, format: LogFormat, log_level: Option<&str>) {
    if !console_output {
        return;
    }

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter(log_level))
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter(log_level))
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
    }
}

/// Shutdown telemetry, flushing any pending spans.
#[cfg(feature = "telemetry")]
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("Telemetry shutdown complete");
}

/// Placeholder for when telemetry feature is disabled.
#[cfg(not(feature = "telemetry"))]
pub fn init_telemetry(_config: &TelemetryConfig) -> SoukResult<()> {
    Ok(())
}

/// Placeholder for when telemetry feature is disabled.
#[cfg(not(feature = "telemetry"))]
pub fn shutdown_telemetry() {}
