//! Sandbox service
//!
//! Dispatches the typed requests (DISCOVER, START, GET_TOOLS, CALL_TOOL, STOP,
//! LIST) to the discovery adapter, the lifecycle manager, the registry and the
//! transports. Validation and orchestration live here; container, wire and
//! oracle details do not.

pub mod messages;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::config::{BrokerConfig, LimitSettings};
use crate::discovery::{BootstrapOracle, Discoverer, ReadmeSource, RepositoryRef};
use crate::errors::{SandboxError, StartError, TransportError, TransportErrorKind};
use crate::lifecycle::{ContainerRuntime, LifecycleManager};
use crate::registry::{SandboxEntry, SandboxRegistry};
use crate::transport::{self, HttpTransport, McpTransport, StdioTransport};
use crate::types::{BootstrapMetadata, JsonRpcMessage, Sandbox, SandboxId, SandboxState, TransportKind};

pub use messages::{
    CallToolRequest, DiscoverRequest, MessageType, SandboxRef, SandboxRequest, SandboxResponse,
    StartRequest,
};

/// Upper bound on `tools/list` pages followed for one GET_TOOLS.
const MAX_TOOL_PAGES: usize = 64;

pub struct SandboxService {
    discoverer: Discoverer,
    readme: Arc<dyn ReadmeSource>,
    lifecycle: LifecycleManager,
    registry: SandboxRegistry,
    limits: LimitSettings,
    start_timeout: Duration,
    request_ids: AtomicU64,
}

impl SandboxService {
    pub fn new(
        config: &BrokerConfig,
        oracle: Arc<dyn BootstrapOracle>,
        readme: Arc<dyn ReadmeSource>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            discoverer: Discoverer::new(oracle),
            readme,
            lifecycle: LifecycleManager::new(runtime, config.docker.clone()),
            registry: SandboxRegistry::with_retention(config.limits.retained_stopped),
            limits: config.limits.clone(),
            start_timeout: Duration::from_secs(config.docker.start_timeout_secs),
            request_ids: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub async fn docker_available(&self) -> bool {
        self.lifecycle.runtime().is_available().await
    }

    /// Dispatch one typed request.
    pub async fn handle(&self, request: SandboxRequest) -> Result<SandboxResponse, SandboxError> {
        match request {
            SandboxRequest::Discover(req) => {
                let bootstrap_metadata = self
                    .discover(&req.repository_url, req.repository_readme, req.refresh)
                    .await?;
                Ok(SandboxResponse::Discovered { bootstrap_metadata })
            }
            SandboxRequest::Start(req) => {
                let sandbox_id = self.start(req.bootstrap_metadata).await?;
                Ok(SandboxResponse::Started { sandbox_id })
            }
            SandboxRequest::GetTools(req) => {
                let tools = self
                    .get_tools(&req.sandbox_id, messages::timeout_from_ms(req.timeout_ms))
                    .await?;
                Ok(SandboxResponse::Tools { tools })
            }
            SandboxRequest::CallTool(req) => {
                let timeout = messages::timeout_from_ms(req.timeout_ms);
                let response = self.call_tool(&req.sandbox_id, req.message, timeout).await?;
                Ok(SandboxResponse::ToolResult {
                    sandbox_id: req.sandbox_id,
                    response,
                })
            }
            SandboxRequest::Stop(req) => {
                self.stop(&req.sandbox_id).await?;
                Ok(SandboxResponse::Stopped {})
            }
            SandboxRequest::List => Ok(SandboxResponse::Sandboxes {
                sandboxes: self.list().await,
            }),
        }
    }

    /// DISCOVER: fetch the README when the caller did not send one, then ask
    /// the oracle. The registry is not touched.
    pub async fn discover(
        &self,
        repository_url: &str,
        readme: Option<String>,
        refresh: bool,
    ) -> Result<BootstrapMetadata, SandboxError> {
        let repository = RepositoryRef::parse(repository_url)?;

        let readme = match readme {
            Some(readme) => readme,
            None if !refresh && self.discoverer.cached(repository_url).await.is_some() => String::new(),
            None => self.readme.fetch(&repository).await?,
        };
        let readme = (!readme.trim().is_empty()).then_some(readme);

        Ok(self
            .discoverer
            .discover(repository_url, readme.as_deref(), refresh)
            .await?)
    }

    /// START: build, run, handshake, register. Nothing is registered unless
    /// every step succeeds, and a container started along the way is removed
    /// again on failure.
    pub async fn start(&self, metadata: BootstrapMetadata) -> Result<SandboxId, SandboxError> {
        validate_metadata(&metadata)?;

        if let Some(limit) = self.limits.max_sandboxes {
            if self.registry.running_count().await >= limit {
                log::warn!("Refusing START for {}: {} sandboxes running", metadata.repository_url, limit);
                return Err(SandboxError::CapacityExceeded { limit });
            }
        }

        let id = SandboxId::new();
        let kind = metadata.transport_kind();
        log::info!(
            "Starting sandbox {} for {} over {}",
            id,
            metadata.repository_url,
            kind
        );

        let image = self.lifecycle.build(&metadata).await?;
        let mut guard = self.lifecycle.start(&id, &image, &metadata).await?;

        let label = guard.handle().name.clone();
        let transport: Arc<dyn McpTransport> = match kind {
            TransportKind::Stream => match guard.take_stdio() {
                Some(pipe) => Arc::new(StdioTransport::new(label, pipe)),
                None => {
                    guard.release().await;
                    return Err(StartError::Create("container has no attached stdio".to_string()).into());
                }
            },
            TransportKind::Network => match guard.handle().published_port {
                Some(port) => Arc::new(HttpTransport::for_address(
                    &guard.handle().host,
                    port,
                    &metadata.endpoint_path,
                )),
                None => {
                    guard.release().await;
                    return Err(StartError::Create("container port was not published".to_string()).into());
                }
            },
        };

        let deadline = Instant::now() + self.start_timeout;
        let server_info = match transport::handshake(transport.as_ref(), deadline).await {
            Ok(result) => result.get("serverInfo").cloned(),
            Err(e) => {
                log::warn!("Handshake with sandbox {} failed: {}", id, e);
                transport.close().await;
                guard.release().await;
                return Err(StartError::Handshake(e.to_string()).into());
            }
        };

        let entry = SandboxEntry::new(
            id.clone(),
            Arc::new(metadata),
            image,
            transport.clone(),
            guard.handle().clone(),
            server_info,
        );
        // The guard stays armed until the entry is visible as RUNNING
        if let Err(e) = self.registry.insert(entry, SandboxState::Running).await {
            transport.close().await;
            guard.release().await;
            return Err(e.into());
        }
        guard.commit();

        log::info!("Sandbox {} is running", id);
        Ok(id)
    }

    /// GET_TOOLS: every tool the server lists, following pagination.
    pub async fn get_tools(&self, id: &SandboxId, timeout: Option<Duration>) -> Result<Vec<Value>, SandboxError> {
        let timeout = timeout.unwrap_or_else(|| self.call_timeout());
        let mut tools = Vec::new();
        let mut cursor: Option<Value> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let request = JsonRpcMessage::request(self.next_request_id(), "tools/list", params);
            let response = self.forward(id, request, timeout).await?;

            if let Some(error) = response.error {
                return Err(TransportError::protocol(format!("tools/list failed: {}", error)).into());
            }
            let result = response.result.unwrap_or(Value::Null);
            match result.get("tools") {
                Some(Value::Array(page)) => tools.extend(page.iter().cloned()),
                _ => return Err(TransportError::protocol("tools/list result carries no tools array").into()),
            }

            match result.get("nextCursor") {
                Some(next) if !next.is_null() => cursor = Some(next.clone()),
                _ => return Ok(tools),
            }
        }

        log::warn!("Sandbox {} kept paginating tools/list, returning {} tools", id, tools.len());
        Ok(tools)
    }

    /// CALL_TOOL: forward the envelope verbatim and return the server's
    /// response, JSON-RPC errors included.
    pub async fn call_tool(
        &self,
        id: &SandboxId,
        mut request: JsonRpcMessage,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcMessage, SandboxError> {
        if request.method.as_deref().map(str::is_empty).unwrap_or(true) {
            return Err(SandboxError::invalid_request("envelope has no method"));
        }
        if request.id.is_none() {
            request.id = Some(json!(format!("mcpbox-{}", self.next_request_id())));
        }

        let timeout = timeout.unwrap_or_else(|| self.call_timeout());
        self.forward(id, request, timeout).await
    }

    async fn forward(
        &self,
        id: &SandboxId,
        request: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<JsonRpcMessage, SandboxError> {
        let entry = self.registry.checkout(id).await?;

        let outcome = {
            let _in_flight = entry.enter().await;
            // STOP may have begun while we waited for the gate
            self.registry.ensure_running(id).await?;
            self.registry.touch(id).await;
            entry.transport().call(request, timeout).await
        };

        match outcome {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.kind == TransportErrorKind::Io && entry.transport().is_closed() {
                    log::warn!("Sandbox {} lost its connection: {}", id, e);
                    self.retire_failed(id).await;
                }
                Err(e.into())
            }
        }
    }

    /// STOP: idempotent. Once this returns, the sandbox never routes again.
    pub async fn stop(&self, id: &SandboxId) -> Result<(), SandboxError> {
        match self.registry.state(id).await {
            None => return Err(SandboxError::UnknownSandbox(id.clone())),
            Some(SandboxState::Stopping | SandboxState::Stopped | SandboxState::Failed) => {
                log::debug!("Sandbox {} is already stopping or stopped", id);
                return Ok(());
            }
            Some(SandboxState::Provisioning) => {
                return Err(SandboxError::NotRunning {
                    id: id.clone(),
                    state: SandboxState::Provisioning,
                });
            }
            Some(SandboxState::Running) => {}
        }

        // Late calls now fail fast with NOT_RUNNING
        if self.registry.update_state(id, SandboxState::Stopping).await.is_err() {
            return Ok(());
        }
        log::info!("Stopping sandbox {}", id);

        let final_state = if self.teardown(id).await {
            SandboxState::Stopped
        } else {
            SandboxState::Failed
        };
        if let Err(e) = self.registry.update_state(id, final_state).await {
            log::warn!("Could not record final state of sandbox {}: {}", id, e);
        }
        Ok(())
    }

    /// Mark a sandbox FAILED and release its resources.
    async fn retire_failed(&self, id: &SandboxId) {
        match self.registry.update_state(id, SandboxState::Failed).await {
            Ok(SandboxState::Failed) | Err(_) => return,
            Ok(_) => {}
        }
        self.teardown(id).await;
    }

    /// Drain in-flight calls, close the transport, detach from the registry
    /// and remove the container. Returns whether the container went away
    /// cleanly.
    async fn teardown(&self, id: &SandboxId) -> bool {
        if let Some(entry) = self.registry.entry(id).await {
            let _exclusive = entry.drain().await;
            entry.transport().close().await;
        }

        let Some(handle) = self.registry.remove(id).await else {
            return true;
        };
        match self.lifecycle.stop(handle).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Teardown of sandbox {} failed: {}", id, e);
                false
            }
        }
    }

    pub async fn list(&self) -> Vec<Sandbox> {
        self.registry.list().await
    }

    /// Stop every sandbox that still owns a container.
    pub async fn shutdown(&self) {
        let ids = self.registry.live_ids().await;
        if ids.is_empty() {
            return;
        }
        log::info!("Stopping {} sandboxes", ids.len());
        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("Failed to stop sandbox {} during shutdown: {}", id, e);
            }
        }
    }

    /// Remove labelled containers no registry entry owns, then unused
    /// sandbox images when `docker.prune_images_on_sweep` is set.
    pub async fn sweep_orphans(&self) -> usize {
        let live: HashSet<SandboxId> = self.registry.live_ids().await.into_iter().collect();
        let removed = match self.lifecycle.sweep_orphans(&live).await {
            Ok(removed) => {
                if removed > 0 {
                    log::info!("Removed {} orphaned sandbox containers", removed);
                }
                removed
            }
            Err(e) => {
                log::warn!("Orphan sweep failed: {}", e);
                0
            }
        };

        if self.lifecycle.settings().prune_images_on_sweep {
            self.prune_images().await;
        }
        removed
    }

    /// Remove sandbox images no live sandbox was started from.
    pub async fn prune_images(&self) -> usize {
        let in_use = self.registry.images_in_use().await;
        match self.lifecycle.prune_images(&in_use).await {
            Ok(pruned) => pruned,
            Err(e) => {
                log::warn!("Image pruning failed: {}", e);
                0
            }
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.call_timeout_secs)
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }
}

fn validate_metadata(metadata: &BootstrapMetadata) -> Result<(), SandboxError> {
    RepositoryRef::parse(&metadata.repository_url)
        .map_err(|e| SandboxError::invalid_request(format!("bootstrap_metadata: {}", e)))?;
    if metadata.setup_script.trim().is_empty() {
        return Err(SandboxError::invalid_request("bootstrap_metadata.setup_script is empty"));
    }
    if metadata.run_command.trim().is_empty() {
        return Err(SandboxError::invalid_request("bootstrap_metadata.run_command is empty"));
    }
    if metadata.transport_kind() == TransportKind::Network && metadata.container_port == 0 {
        return Err(SandboxError::invalid_request("bootstrap_metadata.container_port must be set"));
    }
    Ok(())
}
