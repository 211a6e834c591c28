//! Configuration loader with layered sources.

use crate::JobsConfig;
use config::{Config, ConfigError, Environment, File};
use resque_core::CoreError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<JobsConfig>>,
    config_dir: String,
    environment: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with the `RESQUE` prefix and `__` between
    ///    parts (`RESQUE__REDIS__URL`, `RESQUE__WORKER__QUEUES=high,low`)
    ///
    /// The environment name comes from `RESQUE_ENVIRONMENT` and defaults
    /// to `development`.
    pub fn new(config_dir: impl Into<String>) -> Result<Self, CoreError> {
        // Load .env file if present
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var("RESQUE_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        Self::for_environment(config_dir, environment)
    }

    /// Creates a loader for an explicit environment name.
    pub fn for_environment(config_dir: impl Into<String>, environment: impl Into<String>) -> Result<Self, CoreError> {
        let config_dir = config_dir.into();
        let environment = environment.into();
        let config = Self::load_config(&config_dir, &environment)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
            environment,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, CoreError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> JobsConfig {
        self.config.read().await.clone()
    }

    /// Returns the environment name the loader was built for.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Reloads the configuration from disk.
    ///
    /// The previous configuration stays in place if the new one fails to
    /// load or validate.
    pub async fn reload(&self) -> Result<(), CoreError> {
        let new_config = Self::load_config(&self.config_dir, &self.environment)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!(environment = %self.environment, "Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &str, environment: &str) -> Result<JobsConfig, CoreError> {
        info!(environment = %environment, dir = %config_dir, "Loading configuration");

        let mut builder = Config::builder();

        for name in ["default", environment, "local"] {
            let path = format!("{config_dir}/{name}.toml");
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("RESQUE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("worker.queues")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_core_error)?;

        let jobs_config: JobsConfig = config.try_deserialize().map_err(config_error_to_core_error)?;

        Self::validate_config(&jobs_config)?;

        Ok(jobs_config)
    }

    /// Validates the configuration.
    pub fn validate_config(config: &JobsConfig) -> Result<(), CoreError> {
        let url = url::Url::parse(&config.redis.url)
            .map_err(|e| CoreError::configuration(format!("Invalid redis url '{}': {e}", config.redis.url)))?;
        if !matches!(url.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
            return Err(CoreError::configuration(format!(
                "Unsupported redis url scheme '{}'",
                url.scheme()
            )));
        }

        if config.redis.pool_size == 0 {
            return Err(CoreError::configuration("Redis pool size must be at least 1"));
        }

        if config.worker.queues.is_empty() || config.worker.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(CoreError::configuration("Worker queue names must not be empty"));
        }

        if config.worker.interval_ms == 0 {
            return Err(CoreError::configuration("Worker interval must be greater than zero"));
        }

        if config.scheduler.enabled && config.scheduler.poll_interval_secs == 0 {
            return Err(CoreError::configuration("Scheduler poll interval must be greater than zero"));
        }

        if config.status.ttl_secs == 0 {
            warn!("Status ttl is zero; terminal status records will expire immediately");
        }

        Ok(())
    }

    /// Gets a specific configuration value by key path.
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

fn config_error_to_core_error(err: ConfigError) -> CoreError {
    CoreError::Configuration(err.to_string())
}
