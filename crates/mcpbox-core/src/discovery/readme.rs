//! README retrieval for repositories the caller did not describe.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::config::ReadmeSettings;
use crate::discovery::repository::RepositoryRef;
use crate::errors::DiscoveryError;

#[async_trait]
pub trait ReadmeSource: Send + Sync {
    /// Returns the README text, or an empty string when there is none.
    async fn fetch(&self, repository: &RepositoryRef) -> Result<String, DiscoveryError>;
}

/// Fetches READMEs through the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubReadmeSource {
    client: Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubReadmeSource {
    pub fn new(api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_settings(settings: &ReadmeSettings) -> Result<Self, DiscoveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| DiscoveryError::Readme(format!("Failed to build HTTP client: {}", e)))?;
        let mut source = Self::new(settings.api_base.clone(), settings.token.clone());
        source.client = client;
        Ok(source)
    }
}

#[async_trait]
impl ReadmeSource for GitHubReadmeSource {
    async fn fetch(&self, repository: &RepositoryRef) -> Result<String, DiscoveryError> {
        if !repository.is_github() {
            log::info!(
                "No README source for host {}, continuing without one",
                repository.host
            );
            return Ok(String::new());
        }

        let url = format!(
            "{}/repos/{}/{}/readme",
            self.api_base, repository.owner, repository.name
        );
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3.raw")
            .header("User-Agent", concat!("mcpbox/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiscoveryError::Readme(format!("Request to {} failed: {}", url, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                log::info!("Repository {} has no README", repository.slug());
                Ok(String::new())
            }
            status if status.is_success() => response
                .text()
                .await
                .map_err(|e| DiscoveryError::Readme(format!("Failed to read README: {}", e))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DiscoveryError::Readme(format!(
                    "GitHub returned {} for {}: {}",
                    status,
                    repository.slug(),
                    body
                )))
            }
        }
    }
}

/// A README source that never fetches anything.
#[derive(Debug, Clone, Default)]
pub struct NoReadme;

#[async_trait]
impl ReadmeSource for NoReadme {
    async fn fetch(&self, _repository: &RepositoryRef) -> Result<String, DiscoveryError> {
        Ok(String::new())
    }
}
