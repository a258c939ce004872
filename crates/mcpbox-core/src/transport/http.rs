//! MCP streamable HTTP connector for servers listening on a published port.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;

use crate::errors::TransportError;
use crate::transport::sse::SseDecoder;
use crate::transport::{McpTransport, PROTOCOL_VERSION};
use crate::types::{JsonRpcMessage, TransportKind};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
const PROTOCOL_HEADER: &str = "Mcp-Protocol-Version";

/// HTTP connector. Calls may be in flight concurrently; the server pairs
/// each response with its own POST.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    session_id: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            session_id: RwLock::new(None),
        }
    }

    /// `http://<host>:<port><path>`
    pub fn for_address(host: &str, port: u16, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self::new(format!("http://{}:{}{}", host, port, path))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|s| s.clone())
    }

    fn remember_session(&self, response: &Response) {
        let Some(value) = response.headers().get(SESSION_HEADER) else { return };
        if let (Ok(value), Ok(mut slot)) = (value.to_str(), self.session_id.write()) {
            if slot.as_deref() != Some(value) {
                log::debug!("MCP session {} at {}", value, self.endpoint);
                *slot = Some(value.to_string());
            }
        }
    }

    async fn post(&self, message: &JsonRpcMessage) -> Result<Response, TransportError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
            .json(message);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        self.remember_session(&response);
        Ok(response)
    }

    async fn exchange(&self, request: JsonRpcMessage) -> Result<JsonRpcMessage, TransportError> {
        let expected_id = request
            .id
            .clone()
            .ok_or_else(|| TransportError::protocol("requests sent over HTTP need an id"))?;

        let response = self.post(&request).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
            return Err(TransportError::protocol("MCP session expired"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::protocol(format!("HTTP {}: {}", status, body)));
        }
        if status == StatusCode::ACCEPTED {
            return Err(TransportError::protocol("server accepted the request without responding"));
        }

        if is_event_stream(response.headers().get(CONTENT_TYPE)) {
            read_event_stream(response, &expected_id).await
        } else {
            let body = response.bytes().await.map_err(map_reqwest_error)?;
            match_json_body(&body, &expected_id)
        }
    }
}

fn is_event_stream(content_type: Option<&HeaderValue>) -> bool {
    content_type
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::timeout(err.to_string())
    } else if err.is_decode() {
        TransportError::protocol(err.to_string())
    } else {
        TransportError::io(err.to_string())
    }
}

/// A JSON body holds either one message or a batch.
fn match_json_body(body: &[u8], expected_id: &Value) -> Result<JsonRpcMessage, TransportError> {
    let value: Value = serde_json::from_slice(body)?;
    let candidates = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    candidates
        .into_iter()
        .filter_map(|item| serde_json::from_value::<JsonRpcMessage>(item).ok())
        .find(|message| message.is_response() && message.id.as_ref() == Some(expected_id))
        .ok_or_else(|| TransportError::protocol("response body carries no reply to the request"))
}

async fn read_event_stream(response: Response, expected_id: &Value) -> Result<JsonRpcMessage, TransportError> {
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let mut lines = StreamReader::new(Box::pin(stream)).lines();
    let mut decoder = SseDecoder::new();

    loop {
        let event = match lines.next_line().await? {
            Some(line) => decoder.push_line(&line),
            None => match decoder.finish() {
                Some(event) => Some(event),
                None => {
                    return Err(TransportError::io("event stream ended before the response arrived"));
                }
            },
        };
        let Some(event) = event else { continue };

        match serde_json::from_str::<JsonRpcMessage>(&event.data) {
            Ok(message) if message.is_response() && message.id.as_ref() == Some(expected_id) => {
                return Ok(message);
            }
            Ok(message) => log::debug!(
                "Skipping unrelated stream message {}",
                message.method.as_deref().unwrap_or("(response)")
            ),
            Err(_) => log::debug!("Skipping non-JSON event data: {}", event.data),
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn call(&self, request: JsonRpcMessage, timeout: Duration) -> Result<JsonRpcMessage, TransportError> {
        let method = request.method.clone().unwrap_or_default();
        tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| {
                log::warn!("{} at {} timed out after {:?}", method, self.endpoint, timeout);
                TransportError::timeout(format!("no response to '{}' within {:?}", method, timeout))
            })?
    }

    async fn notify(&self, notification: JsonRpcMessage) -> Result<(), TransportError> {
        let response = self.post(&notification).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::protocol(format!("notification rejected with HTTP {}", status)))
        }
    }

    async fn close(&self) {
        let Some(session) = self.session_id() else { return };
        // Best effort
        let result = self
            .client
            .delete(&self.endpoint)
            .header(SESSION_HEADER, session)
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        if let Err(e) = result {
            log::debug!("Terminating MCP session at {} failed: {}", self.endpoint, e);
        }
    }
}
