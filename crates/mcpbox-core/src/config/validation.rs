//! Configuration validation logic

use std::net::SocketAddr;

use crate::config::types::*;
use crate::errors::ConfigError;

impl BrokerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.docker.validate()?;
        self.oracle.validate()?;
        self.limits.validate()?;
        Ok(())
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("server.bind_addr '{}': {}", self.bind_addr, e))
        })?;
        if self.max_body_size == 0 {
            return Err(ConfigError::Invalid(
                "server.max_body_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl DockerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_image.trim().is_empty() {
            return Err(ConfigError::Invalid("docker.base_image cannot be empty".to_string()));
        }

        // Docker repository names are lowercase
        let valid_prefix = |prefix: &str| {
            !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_./".contains(c))
        };
        if !valid_prefix(&self.image_prefix) {
            return Err(ConfigError::Invalid(format!(
                "docker.image_prefix '{}' is not a valid image repository name",
                self.image_prefix
            )));
        }
        if !valid_prefix(&self.container_prefix) || self.container_prefix.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "docker.container_prefix '{}' is not a valid container name prefix",
                self.container_prefix
            )));
        }

        if self.build_timeout_secs == 0 || self.start_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "docker build and start timeouts must be greater than zero".to_string(),
            ));
        }
        if self.ready_attempts == 0 {
            return Err(ConfigError::Invalid(
                "docker.ready_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl OracleSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "oracle.api_base '{}' must be an http(s) URL",
                self.api_base
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("oracle.model cannot be empty".to_string()));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::Invalid(format!(
                    "oracle.temperature {} must be between 0.0 and 2.0",
                    temperature
                )));
            }
        }
        Ok(())
    }
}

impl LimitSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sandboxes == Some(0) {
            return Err(ConfigError::Invalid(
                "limits.max_sandboxes must be at least 1 when set".to_string(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "limits.call_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
