//! Core data model shared by every component.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque sandbox identifier (UUID v4). Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SandboxId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SandboxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Stopped | SandboxState::Failed)
    }

    /// Forward-only lifecycle: PROVISIONING -> RUNNING -> STOPPING -> STOPPED,
    /// with FAILED reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (Provisioning, Running) | (Running, Stopping) | (Stopping, Stopped) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Provisioning => "PROVISIONING",
            SandboxState::Running => "RUNNING",
            SandboxState::Stopping => "STOPPING",
            SandboxState::Stopped => "STOPPED",
            SandboxState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Wire used to talk to a sandboxed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over the container's stdin/stdout.
    #[serde(alias = "stream", alias = "stdio")]
    Stream,
    /// MCP streamable HTTP on a published container port.
    #[serde(alias = "network", alias = "http")]
    Network,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("STREAM"),
            TransportKind::Network => f.write_str("NETWORK"),
        }
    }
}

pub const DEFAULT_RUN_COMMAND: &str = "/run_mcp.sh";
pub const DEFAULT_CONTAINER_PORT: u16 = 8000;
pub const DEFAULT_ENDPOINT_PATH: &str = "/mcp";

fn default_run_command() -> String {
    DEFAULT_RUN_COMMAND.to_string()
}

fn default_container_port() -> u16 {
    DEFAULT_CONTAINER_PORT
}

fn default_endpoint_path() -> String {
    DEFAULT_ENDPOINT_PATH.to_string()
}

/// Everything needed to build and launch one tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapMetadata {
    pub repository_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    pub setup_script: String,
    #[serde(default = "default_run_command")]
    pub run_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
}

impl BootstrapMetadata {
    pub fn new(repository_url: impl Into<String>, setup_script: impl Into<String>) -> Self {
        Self {
            repository_url: repository_url.into(),
            readme: None,
            setup_script: setup_script.into(),
            run_command: default_run_command(),
            transport: None,
            container_port: default_container_port(),
            endpoint_path: default_endpoint_path(),
            environment: HashMap::new(),
        }
    }

    pub fn with_run_command(mut self, run_command: impl Into<String>) -> Self {
        self.run_command = run_command.into();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_container_port(mut self, port: u16) -> Self {
        self.container_port = port;
        self
    }

    pub fn with_endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.endpoint_path = path.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// STREAM unless the metadata says the server speaks HTTP.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.unwrap_or(TransportKind::Stream)
    }
}

/// A built sandbox image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Reference to one live container, owned by its registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    /// Host address the published port is reachable on (NETWORK only).
    pub host: String,
    pub published_port: Option<u16>,
}

/// Read-only view of a sandbox, as returned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: SandboxId,
    pub repository_url: String,
    pub transport_kind: TransportKind,
    pub state: SandboxState,
    pub image: String,
    pub container_name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

/// A JSON-RPC 2.0 envelope. Requests, notifications and responses share the
/// same shape; absent members are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcMessage {
    pub fn request(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(serde_json::json!({ "code": code, "message": message.into() })),
        }
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }
}
