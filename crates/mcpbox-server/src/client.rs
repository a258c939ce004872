//! Typed HTTP client for the `/sandbox` endpoint.

use std::time::Duration;

use mcpbox_core::service::MessageType;
use mcpbox_core::{BootstrapMetadata, JsonRpcMessage, Sandbox, SandboxId};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{HealthResponse, MESSAGE_TYPE_HEADER};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error body.
    #[error("{kind} ({status}): {detail}")]
    Api {
        status: StatusCode,
        kind: String,
        detail: String,
    },

    #[error("Unexpected response body: {0}")]
    Decode(String),
}

impl ClientError {
    /// Error kind reported by the server, if any.
    pub fn kind(&self) -> Option<&str> {
        match self {
            ClientError::Api { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    kind: String,
    detail: String,
}

/// Client for a remote sandbox broker.
pub struct SandboxClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl SandboxClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            // START may spend minutes building an image
            timeout: Duration::from_secs(1200),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one message and decode the success body.
    pub async fn send<T: DeserializeOwned>(&self, kind: MessageType, body: Value) -> Result<T, ClientError> {
        let response = self
            .client
            .post(format!("{}/sandbox", self.base_url))
            .header(MESSAGE_TYPE_HEADER, kind.as_str())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorBody>(&bytes) {
                Ok(body) => ClientError::Api {
                    status,
                    kind: body.error.kind,
                    detail: body.error.detail,
                },
                Err(_) => ClientError::Api {
                    status,
                    kind: "HTTP".to_string(),
                    detail: String::from_utf8_lossy(&bytes).into_owned(),
                },
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub async fn discover(
        &self,
        repository_url: &str,
        repository_readme: Option<&str>,
    ) -> Result<BootstrapMetadata, ClientError> {
        let mut body = json!({ "repository_url": repository_url });
        if let Some(readme) = repository_readme {
            body["repository_readme"] = json!(readme);
        }
        let response: Value = self.send(MessageType::Discover, body).await?;
        field(response, "bootstrap_metadata")
    }

    pub async fn start(&self, metadata: &BootstrapMetadata) -> Result<SandboxId, ClientError> {
        let response: Value = self
            .send(MessageType::Start, json!({ "bootstrap_metadata": metadata }))
            .await?;
        field(response, "sandbox_id")
    }

    pub async fn get_tools(&self, sandbox_id: &SandboxId) -> Result<Vec<Value>, ClientError> {
        let response: Value = self
            .send(MessageType::GetTools, json!({ "sandbox_id": sandbox_id }))
            .await?;
        field(response, "tools")
    }

    pub async fn call_tool(
        &self,
        sandbox_id: &SandboxId,
        message: &JsonRpcMessage,
    ) -> Result<JsonRpcMessage, ClientError> {
        let mut body = serde_json::to_value(message).map_err(|e| ClientError::Decode(e.to_string()))?;
        body["sandbox_id"] = json!(sandbox_id);
        let response: Value = self.send(MessageType::CallTool, body).await?;
        field(response, "response")
    }

    pub async fn stop(&self, sandbox_id: &SandboxId) -> Result<(), ClientError> {
        let _: Value = self
            .send(MessageType::Stop, json!({ "sandbox_id": sandbox_id }))
            .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Sandbox>, ClientError> {
        let response: Value = self.send(MessageType::List, json!({})).await?;
        field(response, "sandboxes")
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

fn field<T: DeserializeOwned>(mut response: Value, name: &str) -> Result<T, ClientError> {
    let value = response
        .get_mut(name)
        .map(Value::take)
        .ok_or_else(|| ClientError::Decode(format!("response has no '{}' field", name)))?;
    serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))
}
