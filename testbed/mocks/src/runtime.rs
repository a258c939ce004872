//! In-memory container runtime.
//!
//! Images are tag strings, containers are tasks running the calculator MCP
//! server: over an in-process duplex pipe for stdio containers, or behind a
//! [`MockMcpHttpServer`] for containers that publish a port.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mcpbox_core::errors::RuntimeError;
use mcpbox_core::lifecycle::{
    BuildContext, BuildOutput, ContainerRuntime, ContainerStatus, ManagedContainer, RunSpec, RunningContainer,
    StdioPipe, LABEL_MANAGED, LABEL_SANDBOX_ID,
};
use tokio::task::JoinHandle;

use crate::calculator::{serve_stdio, ServerBehavior};
use crate::mcp_http::MockMcpHttpServer;

/// A setup script containing this line fails to build.
pub const BUILD_FAILURE_MARKER: &str = "# mcpbox-test: fail-build";

const PIPE_CAPACITY: usize = 64 * 1024;

struct ContainerRecord {
    name: String,
    image: String,
    labels: HashMap<String, String>,
    task: Option<JoinHandle<()>>,
    http: Option<MockMcpHttpServer>,
    exit_code: Option<i64>,
}

impl ContainerRecord {
    fn status(&self) -> ContainerStatus {
        if let Some(code) = self.exit_code {
            return ContainerStatus {
                running: false,
                exit_code: Some(code),
                published_port: None,
            };
        }
        if let Some(server) = &self.http {
            return ContainerStatus {
                running: true,
                exit_code: None,
                published_port: Some(server.port()),
            };
        }
        match &self.task {
            Some(task) if task.is_finished() => ContainerStatus {
                running: false,
                exit_code: Some(0),
                published_port: None,
            },
            _ => ContainerStatus {
                running: true,
                exit_code: None,
                published_port: None,
            },
        }
    }

    fn halt(&mut self, code: i64) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(mut server) = self.http.take() {
            server.shutdown();
        }
        self.exit_code.get_or_insert(code);
    }
}

pub struct InMemoryRuntime {
    available: bool,
    behavior: Mutex<ServerBehavior>,
    sse: bool,
    fail_runs: Mutex<bool>,
    build_delay: Duration,
    start_delay: Duration,
    images: Mutex<HashSet<String>>,
    builds: Mutex<Vec<BuildContext>>,
    containers: Mutex<HashMap<String, ContainerRecord>>,
    next_id: AtomicUsize,
    stops: AtomicUsize,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self {
            available: true,
            behavior: Mutex::new(ServerBehavior::Calculator),
            sse: false,
            fail_runs: Mutex::new(false),
            build_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
            images: Mutex::new(HashSet::new()),
            builds: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            stops: AtomicUsize::new(0),
        }
    }

    /// A runtime whose daemon is unreachable.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn with_behavior(self, behavior: ServerBehavior) -> Self {
        *self.behavior.lock().unwrap() = behavior;
        self
    }

    /// Network containers answer with SSE streams instead of JSON bodies.
    pub fn with_sse(mut self) -> Self {
        self.sse = true;
        self
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Containers are created at once but take `delay` to report started.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn set_behavior(&self, behavior: ServerBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Make every subsequent `run_container` fail.
    pub fn fail_runs(&self, fail: bool) {
        *self.fail_runs.lock().unwrap() = fail;
    }

    pub fn add_image(&self, tag: &str) {
        self.images.lock().unwrap().insert(tag.to_string());
    }

    /// Register a running, labelled container nobody knows about.
    pub fn add_orphan(&self, name: &str, sandbox_id: &str) -> String {
        let id = self.allocate_id();
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SANDBOX_ID.to_string(), sandbox_id.to_string());
        let task = tokio::spawn(std::future::pending::<()>());
        self.containers.lock().unwrap().insert(
            id.clone(),
            ContainerRecord {
                name: name.to_string(),
                image: String::new(),
                labels,
                task: Some(task),
                http: None,
                exit_code: None,
            },
        );
        id
    }

    /// Simulate the process inside a container dying.
    pub fn kill(&self, id_or_name: &str) -> bool {
        let mut containers = self.containers.lock().unwrap();
        let found = containers
            .iter_mut()
            .find(|(id, record)| id.as_str() == id_or_name || record.name == id_or_name);
        match found {
            Some((_, record)) => {
                record.halt(1);
                true
            }
            None => false,
        }
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }

    pub fn builds(&self) -> Vec<BuildContext> {
        self.builds.lock().unwrap().clone()
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.images.lock().unwrap().contains(tag)
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().unwrap().len()
    }

    /// Containers not yet removed.
    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Names of containers not yet removed.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .unwrap()
            .values()
            .map(|record| record.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Key of the container with this id or name.
    fn lookup(containers: &HashMap<String, ContainerRecord>, id_or_name: &str) -> Option<String> {
        if containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        containers
            .iter()
            .find(|(_, record)| record.name == id_or_name)
            .map(|(id, _)| id.clone())
    }

    fn allocate_id(&self) -> String {
        format!("container-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn unavailable_error(&self) -> RuntimeError {
        RuntimeError::Unavailable("in-memory runtime is switched off".to_string())
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, RuntimeError> {
        if !self.available {
            return Err(self.unavailable_error());
        }
        Ok(self.has_image(tag))
    }

    async fn build_image(&self, context: BuildContext) -> Result<BuildOutput, RuntimeError> {
        if !self.available {
            return Err(self.unavailable_error());
        }
        self.builds.lock().unwrap().push(context.clone());
        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }

        let mut logs = String::new();
        for line in context.dockerfile.lines().filter(|l| !l.trim().is_empty()) {
            logs.push_str(&format!("Step: {}\n", line));
        }

        if context.setup_script.contains(BUILD_FAILURE_MARKER) {
            logs.push_str("setup.sh: command failed with exit code 1\n");
            return Ok(BuildOutput {
                image_id: None,
                logs,
                error: Some("The command '/bin/sh -c bash /tmp/setup.sh' returned a non-zero code: 1".to_string()),
            });
        }

        self.images.lock().unwrap().insert(context.tag.clone());
        logs.push_str(&format!("Successfully tagged {}\n", context.tag));
        Ok(BuildOutput {
            image_id: Some(format!("sha256:{}", context.tag.replace([':', '/'], "-"))),
            logs,
            error: None,
        })
    }

    async fn run_container(&self, spec: RunSpec) -> Result<RunningContainer, RuntimeError> {
        if !self.available {
            return Err(self.unavailable_error());
        }
        if *self.fail_runs.lock().unwrap() {
            return Err(RuntimeError::Other(format!("cannot create container {}", spec.name)));
        }
        if !self.has_image(&spec.image) {
            return Err(RuntimeError::Other(format!("No such image: {}", spec.image)));
        }

        let id = self.allocate_id();
        let behavior = *self.behavior.lock().unwrap();
        let mut record = ContainerRecord {
            name: spec.name.clone(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            task: None,
            http: None,
            exit_code: None,
        };

        let stdio = if spec.attach_stdio {
            let (client_in, server_in) = tokio::io::duplex(PIPE_CAPACITY);
            let (server_out, client_out) = tokio::io::duplex(PIPE_CAPACITY);
            record.task = Some(tokio::spawn(serve_stdio(server_in, server_out, behavior)));
            Some(StdioPipe {
                stdin: Box::pin(client_in),
                stdout: Box::pin(client_out),
            })
        } else {
            if spec.publish_port.is_some() && behavior != ServerBehavior::Exit {
                record.http = Some(MockMcpHttpServer::start(self.sse).await);
            } else {
                record.task = Some(tokio::spawn(async {}));
            }
            None
        };

        self.containers.lock().unwrap().insert(id.clone(), record);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        log::debug!("In-memory container {} ({}) started", spec.name, id);
        Ok(RunningContainer {
            id,
            name: spec.name,
            stdio,
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(ContainerRecord::status)
            .ok_or_else(|| RuntimeError::Other(format!("No such container: {}", id)))
    }

    async fn container_logs(&self, id: &str) -> Result<String, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let record = containers
            .get(id)
            .ok_or_else(|| RuntimeError::Other(format!("No such container: {}", id)))?;
        Ok(format!("{} exited\n", record.name))
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        if let Some(key) = Self::lookup(&containers, id) {
            if let Some(record) = containers.get_mut(&key) {
                record.halt(137);
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        if let Some(key) = Self::lookup(&containers, id) {
            if let Some(mut record) = containers.remove(&key) {
                record.halt(137);
            }
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        if !self.available {
            return Err(self.unavailable_error());
        }
        let containers = self.containers.lock().unwrap();
        let mut managed: Vec<ManagedContainer> = containers
            .iter()
            .filter(|(_, record)| record.labels.contains_key(LABEL_MANAGED))
            .map(|(id, record)| ManagedContainer {
                id: id.clone(),
                name: record.name.clone(),
                sandbox_id: record.labels.get(LABEL_SANDBOX_ID).cloned(),
            })
            .collect();
        managed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(managed)
    }
    async fn list_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError> {
        if !self.available {
            return Err(self.unavailable_error());
        }
        let prefix = format!("{}:", repository);
        let mut tags: Vec<String> = self
            .images
            .lock()
            .unwrap()
            .iter()
            .filter(|tag| tag.starts_with(&prefix))
            .cloned()
            .collect();
        tags.sort();
        Ok(tags)
    }

    async fn remove_image(&self, tag: &str) -> Result<bool, RuntimeError> {
        if !self.available {
            return Err(self.unavailable_error());
        }
        let in_use = self.containers.lock().unwrap().values().any(|record| record.image == tag);
        if in_use {
            return Ok(false);
        }
        Ok(self.images.lock().unwrap().remove(tag))
    }
}
