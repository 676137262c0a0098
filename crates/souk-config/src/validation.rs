//! Configuration validation module.
//!
//! Checks every configuration value up front and collects all problems,
//! so a bad deployment fails at startup with the full list instead of one
//! error per restart.

use crate::AppConfig;
use souk_jobs::config::{HealthThresholds, JobsConfig};
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Port number is invalid (must be 1-65535).
    InvalidPort { name: String, value: u16 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Pool size must be between 1 and the maximum.
    InvalidPoolSize { value: usize, maximum: usize },
    /// A queue would never run anything.
    ZeroConcurrency { queue: String },
    /// A count that must be positive is zero.
    ZeroValue { name: String },
    /// Timeout or interval must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// Jitter must be between 0.0 and 1.0.
    InvalidJitter { value: f64 },
    /// Backoff cap below its base delay.
    InvalidBackoffCap { base_delay_ms: u64, max_delay_ms: u64 },
    /// A warning threshold is above its critical counterpart.
    ThresholdOrder {
        name: String,
        warning: u64,
        critical: u64,
    },
    /// Sampling ratio must be between 0.0 and 1.0.
    InvalidSamplingRatio { value: f64 },
    /// Log level is invalid.
    InvalidLogLevel { value: String },
    /// Two scheduled jobs share a name.
    DuplicateScheduleName { name: String },
    /// A scheduled job's cron expression does not parse.
    InvalidCron { name: String, message: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort { name, value } => {
                write!(f, "Invalid port for {}: {} (must be 1-65535)", name, value)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::InvalidPoolSize { value, maximum } => {
                write!(
                    f,
                    "Invalid pool size: {} (must be between 1 and {})",
                    value, maximum
                )
            }
            Self::ZeroConcurrency { queue } => {
                write!(f, "Queue '{}' has concurrency 0", queue)
            }
            Self::ZeroValue { name } => write!(f, "'{}' must be at least 1", name),
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::InvalidJitter { value } => {
                write!(f, "Invalid jitter: {} (must be between 0.0 and 1.0)", value)
            }
            Self::InvalidBackoffCap {
                base_delay_ms,
                max_delay_ms,
            } => {
                write!(
                    f,
                    "Backoff max_delay_ms ({}) is below base_delay_ms ({})",
                    max_delay_ms, base_delay_ms
                )
            }
            Self::ThresholdOrder {
                name,
                warning,
                critical,
            } => {
                write!(
                    f,
                    "Health threshold '{}': warning ({}) is above critical ({})",
                    name, warning, critical
                )
            }
            Self::InvalidSamplingRatio { value } => {
                write!(
                    f,
                    "Invalid sampling ratio: {} (must be between 0.0 and 1.0)",
                    value
                )
            }
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{}' (valid: trace, debug, info, warn, error)",
                    value
                )
            }
            Self::DuplicateScheduleName { name } => {
                write!(f, "Scheduled job '{}' is declared more than once", name)
            }
            Self::InvalidCron { name, message } => {
                write!(f, "Scheduled job '{}' has an invalid cron expression: {}", name, message)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    fn require_positive(&mut self, name: &str, value: u64) {
        if value == 0 {
            self.add_error(ConfigValidationError::NonPositiveTimeout {
                name: name.to_string(),
                value,
            });
        }
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum Redis connection pool size.
    const MAX_POOL_SIZE: usize = 1000;
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::default();

        Self::validate_server(&config.server, &mut result);
        Self::validate_observability(config, &mut result);
        Self::validate_jobs(&config.jobs, &mut result);

        result.into_result()
    }

    fn validate_server(config: &crate::ServerConfig, result: &mut ValidationResult) {
        if config.port == 0 {
            result.add_error(ConfigValidationError::InvalidPort {
                name: "server.port".to_string(),
                value: config.port,
            });
        }
        result.require_positive("server.request_timeout_secs", config.request_timeout_secs);
    }

    fn validate_observability(config: &AppConfig, result: &mut ValidationResult) {
        let level = config.observability.log_level.to_lowercase();
        if !Self::VALID_LOG_LEVELS.contains(&level.as_str()) {
            result.add_error(ConfigValidationError::InvalidLogLevel {
                value: config.observability.log_level.clone(),
            });
        }

        let telemetry = &config.telemetry;
        if !(0.0..=1.0).contains(&telemetry.sampling_ratio) {
            result.add_error(ConfigValidationError::InvalidSamplingRatio {
                value: telemetry.sampling_ratio,
            });
        }

        if let Some(ref endpoint) = telemetry.otlp_endpoint {
            if Url::parse(endpoint).is_err() {
                result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "otlp_endpoint".to_string(),
                    message: format!("Invalid URL format: {}", endpoint),
                });
            }
        }
    }

    fn validate_jobs(config: &JobsConfig, result: &mut ValidationResult) {
        Self::validate_redis(config, result);

        let defaults = &config.defaults;
        if defaults.max_attempts == 0 {
            result.add_error(ConfigValidationError::ZeroValue {
                name: "jobs.defaults.max_attempts".to_string(),
            });
        }
        if defaults.max_payload_bytes == 0 {
            result.add_error(ConfigValidationError::ZeroValue {
                name: "jobs.defaults.max_payload_bytes".to_string(),
            });
        }
        result.require_positive("jobs.defaults.job_timeout_secs", defaults.job_timeout_secs);

        let backoff = &defaults.backoff;
        if !(0.0..=1.0).contains(&backoff.jitter) {
            result.add_error(ConfigValidationError::InvalidJitter {
                value: backoff.jitter,
            });
        }
        if backoff.max_delay_ms < backoff.base_delay_ms {
            result.add_error(ConfigValidationError::InvalidBackoffCap {
                base_delay_ms: backoff.base_delay_ms,
                max_delay_ms: backoff.max_delay_ms,
            });
        }

        let dispatcher = &config.dispatcher;
        result.require_positive("jobs.dispatcher.poll_interval_ms", dispatcher.poll_interval_ms);
        result.require_positive(
            "jobs.dispatcher.heartbeat_interval_secs",
            dispatcher.heartbeat_interval_secs,
        );
        result.require_positive(
            "jobs.dispatcher.reaper_interval_secs",
            dispatcher.reaper_interval_secs,
        );

        for (name, queue) in &config.queues {
            if queue.concurrency == 0 {
                result.add_error(ConfigValidationError::ZeroConcurrency {
                    queue: name.clone(),
                });
            }
            if queue.job_timeout_secs == Some(0) {
                result.require_positive(&format!("jobs.queues.{}.job_timeout_secs", name), 0);
            }
        }

        result.require_positive("jobs.lock.default_ttl_ms", config.lock.default_ttl_ms);
        result.require_positive("jobs.lock.retry_interval_ms", config.lock.retry_interval_ms);
        result.require_positive(
            "jobs.idempotency.default_ttl_secs",
            config.idempotency.default_ttl_secs,
        );

        if config.health.enabled {
            result.require_positive("jobs.health.interval_secs", config.health.interval_secs);
        }
        Self::validate_thresholds(&config.health.thresholds, result);

        if config.scheduler.enabled {
            result.require_positive(
                "jobs.scheduler.poll_interval_ms",
                config.scheduler.poll_interval_ms,
            );
            result.require_positive(
                "jobs.scheduler.leader_ttl_secs",
                config.scheduler.leader_ttl_secs,
            );
        }
        Self::validate_schedules(config, result);
    }

    fn validate_redis(config: &JobsConfig, result: &mut ValidationResult) {
        match Url::parse(&config.redis.url) {
            Ok(url) if matches!(url.scheme(), "redis" | "rediss") => {}
            Ok(url) => {
                result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "redis".to_string(),
                    message: format!("unsupported scheme '{}', expected redis or rediss", url.scheme()),
                });
            }
            Err(e) => {
                result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "redis".to_string(),
                    message: e.to_string(),
                });
            }
        }

        if config.redis.pool_size == 0 || config.redis.pool_size > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::InvalidPoolSize {
                value: config.redis.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }
        if config.redis.key_prefix.is_empty() {
            result.add_error(ConfigValidationError::ZeroValue {
                name: "jobs.redis.key_prefix".to_string(),
            });
        }
    }

    fn validate_thresholds(thresholds: &HealthThresholds, result: &mut ValidationResult) {
        let mut pairs = vec![
            ("waiting", thresholds.warning_waiting, thresholds.critical_waiting),
            ("age_secs", thresholds.warning_age_secs, thresholds.critical_age_secs),
        ];
        if let (Some(warning), Some(critical)) =
            (thresholds.warning_failed, thresholds.critical_failed)
        {
            pairs.push(("failed", warning, critical));
        }

        for (name, warning, critical) in pairs {
            if warning > critical {
                result.add_error(ConfigValidationError::ThresholdOrder {
                    name: name.to_string(),
                    warning,
                    critical,
                });
            }
        }
    }

    fn validate_schedules(config: &JobsConfig, result: &mut ValidationResult) {
        let mut seen = std::collections::HashSet::new();
        for job in &config.scheduler.jobs {
            if !seen.insert(job.name.as_str()) {
                result.add_error(ConfigValidationError::DuplicateScheduleName {
                    name: job.name.clone(),
                });
            }
            if let Err(e) = job.cron.parse::<cron::Schedule>() {
                result.add_error(ConfigValidationError::InvalidCron {
                    name: job.name.clone(),
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
