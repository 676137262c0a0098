//! Application configuration structures.

use serde::{Deserialize, Serialize};
use souk_core::{LogFormat, TelemetryConfig};
use souk_jobs::JobsConfig;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging and metrics configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// OpenTelemetry export configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Job coordination core configuration.
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "souk".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Enable CORS.
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// CORS allowed origins.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the request timeout as a Duration.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (pretty, json).
    #[serde(default)]
    pub log_format: LogFormat,
    /// Install the Prometheus recorder and serve it over HTTP.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics endpoint path.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_enabled: true,
            metrics_path: default_metrics_path(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl AppConfig {
    /// Telemetry settings with the observability section folded in.
    #[must_use]
    pub fn telemetry_config(&self) -> TelemetryConfig {
        let mut telemetry = self.telemetry.clone();
        telemetry.log_format = self.observability.log_format;
        telemetry.log_level = Some(self.observability.log_level.to_lowercase());
        if telemetry.service_name.is_empty() {
            telemetry.service_name = self.app.name.clone();
        }
        telemetry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.app.name, "souk");
        assert_eq!(config.jobs.defaults.max_attempts, 3);
        assert!(config.observability.metrics_enabled);
    }

    #[test]
    fn test_server_address() {
        let config = ServerConfig::default();
        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "server": { "port": 9000 },
            "jobs": { "queues": { "webhooks": { "concurrency": 8 } } }
        }))
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.jobs.queue("webhooks").concurrency, 8);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_telemetry_config_takes_observability_settings() {
        let mut config = AppConfig::default();
        config.observability.log_level = "DEBUG".to_string();
        config.observability.log_format = LogFormat::Json;

        let telemetry = config.telemetry_config();
        assert_eq!(telemetry.log_format, LogFormat::Json);
        assert_eq!(telemetry.log_level.as_deref(), Some("debug"));
        assert_eq!(telemetry.service_name, "souk");
    }
}
