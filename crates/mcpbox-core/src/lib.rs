//! Sandboxed execution of third-party MCP tool servers.
//!
//! Given a repository reference, `mcpbox-core` asks a bootstrap oracle how to
//! install and launch the server, builds a disposable container image for it,
//! runs it in isolation, and brokers JSON-RPC tool traffic over whichever wire
//! the server speaks (stdio framing or streamable HTTP).
//!
//! The [`service::SandboxService`] is the entry point; everything else is a
//! collaborator it orchestrates.

pub mod config;
pub mod discovery;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod service;
pub mod transport;
pub mod types;

pub use config::{BrokerConfig, ConfigLoader};
pub use errors::{SandboxError, TransportError, TransportErrorKind};
pub use service::{SandboxRequest, SandboxResponse, SandboxService};
pub use types::{BootstrapMetadata, JsonRpcMessage, Sandbox, SandboxId, SandboxState, TransportKind};
