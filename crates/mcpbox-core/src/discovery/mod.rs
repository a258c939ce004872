//! Bootstrap discovery
//!
//! Turns a repository reference (plus its README) into [`BootstrapMetadata`]
//! by asking a [`BootstrapOracle`] for a setup script, cleaning the answer up,
//! and inferring how the resulting server is launched and spoken to. Results
//! are cached per repository so repeated discovery does not re-invoke the
//! oracle.

pub mod oracle;
pub mod prompt;
pub mod readme;
pub mod repository;
pub mod script;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::errors::DiscoveryError;
use crate::types::BootstrapMetadata;

pub use oracle::{BootstrapOracle, OpenAiOracle};
pub use readme::{GitHubReadmeSource, NoReadme, ReadmeSource};
pub use repository::RepositoryRef;

pub struct Discoverer {
    oracle: Arc<dyn BootstrapOracle>,
    cache: RwLock<HashMap<String, BootstrapMetadata>>,
}

impl Discoverer {
    pub fn new(oracle: Arc<dyn BootstrapOracle>) -> Self {
        Self {
            oracle,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Produce bootstrap metadata for a repository, reusing a cached answer
    /// unless `refresh` is set. The adapter never fetches the README itself.
    pub async fn discover(
        &self,
        repository_url: &str,
        readme: Option<&str>,
        refresh: bool,
    ) -> Result<BootstrapMetadata, DiscoveryError> {
        let repository = RepositoryRef::parse(repository_url)?;
        let cache_key = repository.canonical_url();

        if !refresh {
            if let Some(cached) = self.cache.read().await.get(&cache_key) {
                log::debug!("Discovery cache hit for {}", cache_key);
                return Ok(cached.clone());
            }
        }

        let readme = readme.unwrap_or_default();
        let user_prompt = prompt::build_prompt(repository_url.trim(), readme);

        log::info!("Generating setup script for {}", repository.slug());
        let raw = self.oracle.generate(prompt::SYSTEM_PROMPT, &user_prompt).await?;

        let setup_script = script::strip_code_fence(&raw);
        script::validate_script(&setup_script)?;

        let hint = script::infer_transport(&setup_script, readme);
        let mut metadata = BootstrapMetadata::new(repository_url.trim(), setup_script.clone())
            .with_run_command(script::infer_run_command(&setup_script))
            .with_transport(hint.kind);
        if let Some(port) = hint.port {
            metadata = metadata.with_container_port(port);
        }
        if let Some(path) = hint.path {
            metadata = metadata.with_endpoint_path(path);
        }
        if !readme.trim().is_empty() {
            metadata.readme = Some(readme.to_string());
        }

        log::info!(
            "Discovered {} (run command {}, transport {})",
            repository.slug(),
            metadata.run_command,
            metadata.transport_kind()
        );

        self.cache.write().await.insert(cache_key, metadata.clone());
        Ok(metadata)
    }

    pub async fn cached(&self, repository_url: &str) -> Option<BootstrapMetadata> {
        let key = RepositoryRef::parse(repository_url).ok()?.canonical_url();
        self.cache.read().await.get(&key).cloned()
    }

    pub async fn forget(&self, repository_url: &str) {
        if let Ok(repository) = RepositoryRef::parse(repository_url) {
            self.cache.write().await.remove(&repository.canonical_url());
        }
    }
}
