//! Configuration loader for YAML files and environment resolution

use std::env;
use std::path::Path;

use tokio::fs;

use crate::config::types::*;
use crate::errors::ConfigError;

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<BrokerConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::from_str(&content)
    }

    /// Load configuration from a YAML file, falling back to defaults when the
    /// file does not exist.
    pub async fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<BrokerConfig, ConfigError> {
        let path = path.as_ref();
        if fs::metadata(path).await.is_err() {
            log::info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            let mut config = BrokerConfig::default();
            Self::resolve_environment(&mut config);
            config.validate()?;
            return Ok(config);
        }
        Self::from_file(path).await
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<BrokerConfig, ConfigError> {
        let mut config: BrokerConfig = if content.trim().is_empty() {
            BrokerConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
        };

        Self::resolve_environment(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides from the process environment
    pub fn resolve_environment(config: &mut BrokerConfig) {
        Self::resolve_environment_with(config, |key| env::var(key).ok());
    }

    /// Apply environment overrides from an arbitrary lookup.
    ///
    /// Credentials only come from the environment when the file leaves them
    /// unset; `MCPBOX_BASE_IMAGE` always wins over the file.
    pub fn resolve_environment_with<F>(config: &mut BrokerConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if config.oracle.api_key.is_none() {
            config.oracle.api_key =
                non_empty("MCPBOX_ORACLE_API_KEY").or_else(|| non_empty("OPENAI_API_KEY"));
        }
        if config.readme.token.is_none() {
            config.readme.token = non_empty("GITHUB_TOKEN");
        }
        if let Some(image) = non_empty("MCPBOX_BASE_IMAGE") {
            config.docker.base_image = image;
        }
    }
}
