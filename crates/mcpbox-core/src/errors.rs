//! Error types for every stage of a sandbox's life
//!
//! Each collaborator reports failures in its own vocabulary (discovery, image
//! build, container start and stop, transport, registry). The service folds
//! them into [`SandboxError`], whose [`SandboxError::kind`] is the stable
//! identifier surfaced to callers.

use std::time::Duration;

use thiserror::Error;

use crate::types::{SandboxId, SandboxState};

#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("Invalid repository reference '{0}'")]
    InvalidRepository(String),
    #[error("Bootstrap oracle failed: {0}")]
    Oracle(String),
    #[error("Generated setup script rejected: {0}")]
    MalformedScript(String),
    #[error("README fetch failed: {0}")]
    Readme(String),
}

/// A failed image build. `logs` carries whatever build output was captured.
#[derive(Error, Debug, Clone)]
#[error("Image build failed: {reason}")]
pub struct BuildError {
    pub reason: String,
    pub logs: String,
}

impl BuildError {
    pub fn new(reason: impl Into<String>, logs: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            logs: logs.into(),
        }
    }

    pub fn timed_out(after: Duration, logs: impl Into<String>) -> Self {
        Self::new(format!("build exceeded {}s", after.as_secs()), logs)
    }
}

#[derive(Error, Debug, Clone)]
pub enum StartError {
    #[error("Container could not be created: {0}")]
    Create(String),
    #[error("Container never reached the running state: {0}")]
    NotReady(String),
    #[error("MCP handshake failed: {0}")]
    Handshake(String),
    #[error("Container start timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug, Clone)]
#[error("Failed to stop container '{container}': {reason}")]
pub struct StopError {
    pub container: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Protocol,
    Io,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "TIMEOUT",
            TransportErrorKind::Protocol => "PROTOCOL",
            TransportErrorKind::Io => "IO",
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("Transport {} error: {detail}", kind.as_str())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            detail: detail.into(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Protocol,
            detail: detail.into(),
        }
    }

    pub fn io(detail: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Io,
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::protocol(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::io(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Unknown sandbox '{0}'")]
    UnknownSandbox(SandboxId),
    #[error("Sandbox '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: SandboxId,
        from: SandboxState,
        to: SandboxState,
    },
    #[error("Sandbox '{0}' is already registered")]
    Duplicate(SandboxId),
}

// Failures of the container runtime primitives themselves
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Bollard (Docker client) error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error during container operation: {0}")]
    Io(#[from] std::io::Error),
    #[error("Container runtime error: {0}")]
    Other(String),
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {reason}")]
    Read { path: String, reason: String },
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Umbrella error returned by every service operation.
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error("Sandbox capacity of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("Unknown sandbox '{0}'")]
    UnknownSandbox(SandboxId),
    #[error("Sandbox '{id}' is not running (state {state})")]
    NotRunning { id: SandboxId, state: SandboxState },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable identifier of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::InvalidRequest(_) => "INVALID_REQUEST",
            SandboxError::Discovery(_) => "DISCOVERY_ERROR",
            SandboxError::Build(_) => "BUILD_ERROR",
            SandboxError::Start(_) => "START_ERROR",
            SandboxError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            SandboxError::UnknownSandbox(_) => "UNKNOWN_SANDBOX",
            SandboxError::NotRunning { .. } => "NOT_RUNNING",
            SandboxError::Transport(e) => match e.kind {
                TransportErrorKind::Timeout => "TRANSPORT_TIMEOUT",
                TransportErrorKind::Protocol => "TRANSPORT_PROTOCOL",
                TransportErrorKind::Io => "TRANSPORT_IO",
            },
            SandboxError::Internal(_) => "INTERNAL",
        }
    }

    /// Build logs, when the failure came from an image build.
    pub fn build_logs(&self) -> Option<&str> {
        match self {
            SandboxError::Build(e) if !e.logs.is_empty() => Some(&e.logs),
            _ => None,
        }
    }
}

impl From<RegistryError> for SandboxError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownSandbox(id) => SandboxError::UnknownSandbox(id),
            other => SandboxError::Internal(other.to_string()),
        }
    }
}
