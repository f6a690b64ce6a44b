//! Configuration Loader
//!
//! Environment-aware configuration loading. Discovers an optional TOML file,
//! layers `MCPHUB__`-prefixed environment variables on top, deserializes into
//! [`OrchestratorConfig`], and validates before handing it out.

use super::OrchestratorConfig;
use crate::error::OrchestrationError;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Loaded configuration plus the environment it was resolved for.
pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection.
    pub fn load() -> Result<Arc<Self>, OrchestrationError> {
        let environment = Self::detect_environment();
        Self::load_with_env(&environment, None)
    }

    /// Load configuration for an explicit environment, optionally from a
    /// specific config file. Useful for tests that must not touch global
    /// environment variables.
    pub fn load_with_env(
        environment: &str,
        config_file: Option<PathBuf>,
    ) -> Result<Arc<Self>, OrchestrationError> {
        let file = config_file.unwrap_or_else(|| Self::default_config_file(environment));

        debug!(
            environment = %environment,
            config_file = %file.display(),
            "Loading orchestrator configuration"
        );

        let mut builder = config::Config::builder();
        if file.exists() {
            builder = builder.add_source(config::File::from(file));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MCPHUB")
                .separator("__")
                .try_parsing(true),
        );

        let config: OrchestratorConfig = builder
            .build()
            .map_err(|e| OrchestrationError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| OrchestrationError::Configuration(e.to_string()))?;

        config
            .validate()
            .map_err(OrchestrationError::Configuration)?;

        tracing::info!(
            environment = %environment,
            backend = ?config.backend.kind,
            max_workers = config.executor.max_workers,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(Self {
            config,
            environment: environment.to_string(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Environment this configuration was resolved for
    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn detect_environment() -> String {
        env::var("MCPHUB_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_file(environment: &str) -> PathBuf {
        PathBuf::from("config").join(format!("mcphub-{environment}.toml"))
    }
}
