//! Configuration loader with layered sources.

use crate::validation::{format_validation_errors, ConfigValidator};
use crate::AppConfig;
use config::{Config, ConfigError, Environment, File};
use souk_core::SoukError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Prefix of environment variables that override file configuration.
pub const ENV_PREFIX: &str = "SOUK";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `.env` in the working directory, if present
    /// 2. `{config_dir}/default.toml` - Default values
    /// 3. `{config_dir}/{environment}.toml` - Environment-specific overrides
    /// 4. `{config_dir}/local.toml` - Uncommitted local overrides
    /// 5. Environment variables with `SOUK_` prefix and `__` as the section
    ///    separator, e.g. `SOUK_JOBS__DEFAULTS__MAX_ATTEMPTS=5`
    ///
    /// The merged result is validated and every problem is reported at once.
    pub fn new(config_dir: impl Into<String>) -> Result<Self, SoukError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, SoukError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// The previous configuration stays in place if the new one is invalid.
    pub async fn reload(&self) -> Result<(), SoukError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &str) -> Result<AppConfig, SoukError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var(format!("{ENV_PREFIX}_ENVIRONMENT"))
            .unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_souk_error)?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_souk_error)?;
        app_config.app.environment = environment;

        Self::validate_config(&app_config)?;

        Ok(app_config)
    }

    fn validate_config(config: &AppConfig) -> Result<(), SoukError> {
        ConfigValidator::validate(config)
            .map_err(|errors| SoukError::Configuration(format_validation_errors(&errors)))?;

        if config.app.environment == "production" && config.jobs.redis.url.contains("localhost") {
            warn!("Redis URL points at localhost in production");
        }
        if config.jobs.queues.is_empty() {
            warn!("No queues configured; workers will only serve the 'default' queue");
        }

        Ok(())
    }

    /// Gets a specific configuration value by dotted key path, e.g.
    /// `jobs.defaults.max_attempts`.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

fn config_error_to_souk_error(err: ConfigError) -> SoukError {
    SoukError::Configuration(err.to_string())
}
