//! Transport connectors
//!
//! A sandboxed server is reached either over its attached stdio
//! ([`stdio::StdioTransport`]) or over MCP streamable HTTP on a published port
//! ([`http::HttpTransport`]). Both expose the same request/response contract
//! through [`McpTransport`]; neither interprets method names.

pub mod http;
pub mod sse;
pub mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::errors::{TransportError, TransportErrorKind};
use crate::types::{JsonRpcMessage, TransportKind};

pub use http::HttpTransport;
pub use stdio::StdioTransport;

pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Delay between handshake attempts while an HTTP server is still binding.
const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[async_trait]
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a request and wait for the response carrying the same id.
    async fn call(&self, request: JsonRpcMessage, timeout: Duration) -> Result<JsonRpcMessage, TransportError>;

    /// Send a message that expects no response.
    async fn notify(&self, notification: JsonRpcMessage) -> Result<(), TransportError>;

    /// Whether the underlying connection is known to be gone.
    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self);
}

pub fn initialize_request(id: u64) -> JsonRpcMessage {
    JsonRpcMessage::request(
        id,
        "initialize",
        Some(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcpbox",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })),
    )
}

/// MCP handshake: `initialize` then `notifications/initialized`. Returns the
/// server's `initialize` result.
pub async fn initialize(transport: &dyn McpTransport, timeout: Duration) -> Result<Value, TransportError> {
    let response = transport.call(initialize_request(0), timeout).await?;

    if let Some(error) = response.error {
        return Err(TransportError::protocol(format!("initialize rejected: {}", error)));
    }
    let result = response
        .result
        .ok_or_else(|| TransportError::protocol("initialize response carries no result"))?;

    transport
        .notify(JsonRpcMessage::notification("notifications/initialized", None))
        .await?;
    Ok(result)
}

/// Handshake bounded by `deadline`. NETWORK servers may still be binding
/// their port, so connection failures are retried until the deadline.
pub async fn handshake(transport: &dyn McpTransport, deadline: Instant) -> Result<Value, TransportError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::timeout("handshake deadline exceeded"));
        }

        match initialize(transport, remaining).await {
            Err(e)
                if e.kind == TransportErrorKind::Io
                    && transport.kind() == TransportKind::Network
                    && Instant::now() + HANDSHAKE_RETRY_INTERVAL < deadline =>
            {
                log::debug!("Server not reachable yet, retrying handshake: {}", e);
                tokio::time::sleep(HANDSHAKE_RETRY_INTERVAL).await;
            }
            outcome => return outcome,
        }
    }
}
