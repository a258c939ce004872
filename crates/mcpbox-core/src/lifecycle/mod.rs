//! Image and container lifecycle
//!
//! The [`LifecycleManager`] turns bootstrap metadata into a built image and a
//! running container, and tears containers down again. It talks to the
//! container technology only through the [`ContainerRuntime`] trait;
//! [`docker::DockerRuntime`] is the production implementation.

pub mod docker;
pub mod guard;
pub mod image;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::DockerSettings;
use crate::errors::{BuildError, RuntimeError, StartError, StopError};
use crate::types::{BootstrapMetadata, ContainerHandle, ImageRef, SandboxId, TransportKind};

pub use docker::DockerRuntime;
pub use guard::ContainerGuard;

/// Label marking containers created by this broker.
pub const LABEL_MANAGED: &str = "mcpbox.managed";
/// Label carrying the owning sandbox id.
pub const LABEL_SANDBOX_ID: &str = "mcpbox.sandbox-id";

/// Lines of container output kept when reporting a failed start.
const LOG_TAIL_LINES: usize = 40;

/// Inputs of one image build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub tag: String,
    pub dockerfile: String,
    pub setup_script: String,
}

/// Result of a build the daemon accepted. `error` is set when a build step
/// failed.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub image_id: Option<String>,
    pub logs: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Keep stdin open and attach stdin/stdout.
    pub attach_stdio: bool,
    /// Container port to publish on an ephemeral host port.
    pub publish_port: Option<u16>,
    pub publish_host: String,
}

/// Attached standard streams of a container.
pub struct StdioPipe {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
}

impl fmt::Debug for StdioPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioPipe").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub stdio: Option<StdioPipe>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub published_port: Option<u16>,
}

/// A container carrying our labels, as seen by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub sandbox_id: Option<String>,
}

/// Container technology primitives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn image_exists(&self, tag: &str) -> Result<bool, RuntimeError>;

    async fn build_image(&self, context: BuildContext) -> Result<BuildOutput, RuntimeError>;

    /// Creates and starts a container. Implementations remove whatever they
    /// created when they fail part-way.
    async fn run_container(&self, spec: RunSpec) -> Result<RunningContainer, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;

    /// Tags of local images in the `repository`.
    async fn list_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError>;

    /// Removes an image tag. Returns `false` when nothing was removed because
    /// the image is gone or a container still uses it.
    async fn remove_image(&self, tag: &str) -> Result<bool, RuntimeError>;
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    settings: DockerSettings,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: DockerSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn settings(&self) -> &DockerSettings {
        &self.settings
    }

    pub fn container_name(&self, sandbox_id: &SandboxId) -> String {
        format!("{}-{}", self.settings.container_prefix, sandbox_id)
    }

    /// Build (or reuse) the image for a sandbox. A failed build yields no image.
    pub async fn build(&self, metadata: &BootstrapMetadata) -> Result<ImageRef, BuildError> {
        let base_image = &self.settings.base_image;
        let tag = image::image_tag(&self.settings.image_prefix, base_image, metadata);

        if self.settings.reuse_images {
            match self.runtime.image_exists(&tag).await {
                Ok(true) => {
                    log::info!("Reusing existing image {} for {}", tag, metadata.repository_url);
                    return Ok(ImageRef { tag, id: None });
                }
                Ok(false) => {}
                Err(e) => log::debug!("Could not check for image {}: {}", tag, e),
            }
        }

        let context = BuildContext {
            tag: tag.clone(),
            dockerfile: image::render_dockerfile(base_image, metadata),
            setup_script: metadata.setup_script.clone(),
        };

        log::info!("Building image {} for {}", tag, metadata.repository_url);
        let timeout = Duration::from_secs(self.settings.build_timeout_secs);
        let output = match tokio::time::timeout(timeout, self.runtime.build_image(context)).await {
            Err(_) => {
                log::warn!("Build of {} timed out after {:?}", tag, timeout);
                return Err(BuildError::timed_out(timeout, ""));
            }
            Ok(Err(e)) => return Err(BuildError::new(e.to_string(), "")),
            Ok(Ok(output)) => output,
        };

        if let Some(reason) = output.error {
            log::warn!("Build of {} failed: {}", tag, reason);
            return Err(BuildError::new(reason, output.logs));
        }

        log::info!("Built image {}", tag);
        Ok(ImageRef {
            tag,
            id: output.image_id,
        })
    }

    /// Start a new container for a sandbox and wait until it is running.
    pub async fn start(
        &self,
        sandbox_id: &SandboxId,
        image: &ImageRef,
        metadata: &BootstrapMetadata,
    ) -> Result<ContainerGuard, StartError> {
        let kind = metadata.transport_kind();
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SANDBOX_ID.to_string(), sandbox_id.to_string());

        let spec = RunSpec {
            name: self.container_name(sandbox_id),
            image: image.tag.clone(),
            env: metadata.environment.clone(),
            labels,
            attach_stdio: kind == TransportKind::Stream,
            publish_port: (kind == TransportKind::Network).then_some(metadata.container_port),
            publish_host: self.settings.publish_host.clone(),
        };

        let start_timeout = Duration::from_secs(self.settings.start_timeout_secs);
        let grace = Duration::from_secs(self.settings.stop_grace_secs);
        // Armed by name until run_container returns; the runtime accepts a
        // name wherever it takes an id.
        let pending = ContainerGuard::new(
            self.runtime.clone(),
            ContainerHandle {
                id: spec.name.clone(),
                name: spec.name.clone(),
                host: self.settings.publish_host.clone(),
                published_port: None,
            },
            None,
            grace,
        );
        let running = match tokio::time::timeout(start_timeout, self.runtime.run_container(spec)).await {
            Ok(Ok(running)) => {
                pending.commit();
                running
            }
            Ok(Err(e)) => {
                pending.release().await;
                return Err(StartError::Create(e.to_string()));
            }
            Err(_) => {
                log::warn!("Container for sandbox {} did not start within {:?}", sandbox_id, start_timeout);
                pending.release().await;
                return Err(StartError::Timeout(start_timeout));
            }
        };

        log::info!("Started container {} for sandbox {}", running.name, sandbox_id);
        let handle = ContainerHandle {
            id: running.id,
            name: running.name,
            host: self.settings.publish_host.clone(),
            published_port: None,
        };
        let mut guard = ContainerGuard::new(self.runtime.clone(), handle, running.stdio, grace);

        match self.wait_until_running(guard.handle(), kind).await {
            Ok(status) => {
                guard.handle_mut().published_port = status.published_port;
                Ok(guard)
            }
            Err(e) => {
                guard.release().await;
                Err(e)
            }
        }
    }

    async fn wait_until_running(
        &self,
        handle: &ContainerHandle,
        kind: TransportKind,
    ) -> Result<ContainerStatus, StartError> {
        let interval = Duration::from_millis(self.settings.ready_interval_ms);
        let mut last_error = String::from("container never reported running");

        for attempt in 1..=self.settings.ready_attempts {
            match self.runtime.inspect_container(&handle.id).await {
                Ok(status) if status.running => {
                    if kind == TransportKind::Network && status.published_port.is_none() {
                        last_error = "published port not yet assigned".to_string();
                    } else {
                        return Ok(status);
                    }
                }
                Ok(status) if status.exit_code.is_some() => {
                    let logs = self.log_tail(&handle.id).await;
                    return Err(StartError::NotReady(format!(
                        "container exited with code {}{}",
                        status.exit_code.unwrap_or_default(),
                        logs
                    )));
                }
                Ok(_) => {}
                Err(e) => last_error = e.to_string(),
            }

            log::debug!(
                "Container {} not running yet (attempt {}/{})",
                handle.name,
                attempt,
                self.settings.ready_attempts
            );
            tokio::time::sleep(interval).await;
        }

        let logs = self.log_tail(&handle.id).await;
        Err(StartError::NotReady(format!("{}{}", last_error, logs)))
    }

    async fn log_tail(&self, container_id: &str) -> String {
        match self.runtime.container_logs(container_id).await {
            Ok(logs) if !logs.trim().is_empty() => {
                let lines: Vec<&str> = logs.lines().collect();
                let start = lines.len().saturating_sub(LOG_TAIL_LINES);
                format!("\n{}", lines[start..].join("\n"))
            }
            _ => String::new(),
        }
    }

    /// Graceful stop, then forced removal.
    pub async fn stop(&self, handle: ContainerHandle) -> Result<(), StopError> {
        let grace = Duration::from_secs(self.settings.stop_grace_secs);
        log::info!("Stopping container {}", handle.name);
        guard::teardown(self.runtime.as_ref(), &handle.id, grace)
            .await
            .map_err(|e| StopError {
                container: handle.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Removes containers carrying our labels whose sandbox is not in `live`.
    pub async fn sweep_orphans(&self, live: &HashSet<SandboxId>) -> Result<usize, RuntimeError> {
        let grace = Duration::from_secs(self.settings.stop_grace_secs);
        let mut removed = 0;

        for container in self.runtime.list_managed().await? {
            let owned = container
                .sandbox_id
                .as_deref()
                .map(|id| live.contains(&SandboxId::from(id)))
                .unwrap_or(false);
            if owned {
                continue;
            }

            log::info!("Removing orphaned container {}", container.name);
            match guard::teardown(self.runtime.as_ref(), &container.id, grace).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to remove orphan {}: {}", container.name, e),
            }
        }

        Ok(removed)
    }

    /// Removes sandbox images under our prefix that no tag in `in_use`
    /// names. Images a container still references are skipped.
    pub async fn prune_images(&self, in_use: &HashSet<String>) -> Result<usize, RuntimeError> {
        let mut removed = 0;
        for tag in self.runtime.list_images(&self.settings.image_prefix).await? {
            if in_use.contains(&tag) {
                continue;
            }
            match self.runtime.remove_image(&tag).await {
                Ok(true) => {
                    log::info!("Removed unused image {}", tag);
                    removed += 1;
                }
                Ok(false) => log::debug!("Image {} is still in use", tag),
                Err(e) => log::warn!("Failed to remove image {}: {}", tag, e),
            }
        }
        Ok(removed)
    }
}
