//! Docker-backed container runtime built on bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding, PortMap};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, BuildImageOptionsBuilder,
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    ListContainersOptions as BollardListContainersOptionsQuery,
    ListImagesOptions as BollardListImagesOptionsQuery, LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptionsBuilder, RemoveImageOptions as BollardRemoveImageOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio_util::io::StreamReader;

use crate::errors::RuntimeError;
use crate::lifecycle::{
    image, BuildContext, BuildOutput, ContainerRuntime, ContainerStatus, ManagedContainer,
    RunSpec, RunningContainer, StdioPipe, LABEL_MANAGED, LABEL_SANDBOX_ID,
};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn attach_stdio(&self, container_id: &str, name: &str) -> Result<StdioPipe, RuntimeError> {
        let options = AttachContainerOptionsBuilder::default()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .stream(true)
            .build();
        let attached = self.docker.attach_container(container_id, Some(options)).await?;

        // stderr is diagnostic only; stdout carries the protocol
        let name = name.to_string();
        let stdout = attached.output.filter_map(move |item| {
            let name = name.clone();
            async move {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(message))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        log::debug!(
                            "[{}] stderr: {}",
                            name,
                            String::from_utf8_lossy(&message).trim_end()
                        );
                        None
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(std::io::Error::other(e.to_string()))),
                }
            }
        });

        Ok(StdioPipe {
            stdin: attached.input,
            stdout: Box::pin(StreamReader::new(Box::pin(stdout))),
        })
    }

    async fn discard(&self, container_id: &str) {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        if let Err(e) = self.docker.remove_container(container_id, Some(options)).await {
            log::warn!("Failed to remove container {}: {}", container_id, e);
        }
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 404, .. })
}

fn is_conflict(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 409, .. })
}

fn is_not_modified(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 304, .. })
}

/// First host port bound for any published container port.
pub(crate) fn first_published_port(ports: &PortMap) -> Option<u16> {
    let mut keys: Vec<&String> = ports.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|key| ports.get(key).and_then(|b| b.as_ref()))
        .flat_map(|bindings| bindings.iter())
        .filter_map(|binding| binding.host_port.as_deref())
        .find_map(|port| port.parse::<u16>().ok().filter(|p| *p != 0))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, context: BuildContext) -> Result<BuildOutput, RuntimeError> {
        let archive = image::pack_context(&context)?;
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(&context.tag)
            .rm(true)
            .forcerm(true)
            .build();

        let mut stream = self.docker.build_image(
            options,
            None,
            Some(bollard::body_full(bytes::Bytes::from(archive))),
        );

        let mut output = BuildOutput::default();
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        log::debug!("[build {}] {}", context.tag, line.trim_end());
                        output.logs.push_str(&line);
                    }
                    if let Some(detail) = info.error_detail {
                        let message = detail
                            .message
                            .unwrap_or_else(|| "build step failed".to_string());
                        output.logs.push_str(&message);
                        output.logs.push('\n');
                        output.error = Some(message);
                    }
                }
                Err(BollardError::DockerStreamError { error }) => {
                    output.logs.push_str(&error);
                    output.logs.push('\n');
                    output.error = Some(error);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if output.error.is_none() {
            match self.docker.inspect_image(&context.tag).await {
                Ok(inspect) => output.image_id = inspect.id,
                Err(e) => output.error = Some(format!("built image not found: {}", e)),
            }
        }

        Ok(output)
    }

    async fn run_container(&self, spec: RunSpec) -> Result<RunningContainer, RuntimeError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: PortMap = HashMap::new();
        if let Some(port) = spec.publish_port {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some(spec.publish_host.clone()),
                    host_port: None,
                }]),
            );
        }

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(spec.labels.clone()),
            open_stdin: Some(spec.attach_stdio),
            stdin_once: Some(false),
            attach_stdin: Some(spec.attach_stdio),
            attach_stdout: Some(spec.attach_stdio),
            attach_stderr: Some(spec.attach_stdio),
            tty: Some(false),
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(HostConfig {
                port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;

        // Attach before starting so no early output is lost
        let stdio = if spec.attach_stdio {
            match self.attach_stdio(&container.id, &spec.name).await {
                Ok(pipe) => Some(pipe),
                Err(e) => {
                    self.discard(&container.id).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            self.discard(&container.id).await;
            return Err(e.into());
        }

        Ok(RunningContainer {
            id: container.id,
            name: spec.name,
            stdio,
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<BollardInspectContainerOptionsQuery>)
            .await?;

        let state = inspect.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        let published_port = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| first_published_port(&ports));

        Ok(ContainerStatus {
            running,
            exit_code: if running { None } else { state.exit_code },
            published_port,
        })
    }

    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError> {
        let mut stream = self.docker.logs(
            id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut logs = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(output) => logs.push_str(&String::from_utf8_lossy(&output.into_bytes())),
                Err(e) => {
                    log::debug!("Stopped reading logs of {}: {}", id, e);
                    break;
                }
            }
        }
        Ok(logs)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::default()
            .t(grace.as_secs() as i32)
            .build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) || is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).v(true).build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]);

        let containers = self
            .docker
            .list_containers(Some(BollardListContainersOptionsQuery {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let sandbox_id = summary
                    .labels
                    .and_then(|labels| labels.get(LABEL_SANDBOX_ID).cloned());
                Some(ManagedContainer {
                    id,
                    name,
                    sandbox_id,
                })
            })
            .collect())
    }

    async fn list_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![repository.to_string()]);

        let images = self
            .docker
            .list_images(Some(BollardListImagesOptionsQuery {
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .flat_map(|summary| summary.repo_tags)
            .filter(|tag| is_in_repository(tag, repository))
            .collect())
    }

    async fn remove_image(&self, tag: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .remove_image(tag, None::<BollardRemoveImageOptionsQuery>, None)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) || is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_in_repository(tag: &str, repository: &str) -> bool {
    tag.strip_prefix(repository)
        .map(|rest| rest.starts_with(':'))
        .unwrap_or(false)
}
