//! Typed request and response bodies for the six message types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SandboxError;
use crate::types::{BootstrapMetadata, JsonRpcMessage, Sandbox, SandboxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Discover,
    Start,
    GetTools,
    CallTool,
    Stop,
    List,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Discover => "DISCOVER",
            MessageType::Start => "START",
            MessageType::GetTools => "GET_TOOLS",
            MessageType::CallTool => "CALL_TOOL",
            MessageType::Stop => "STOP",
            MessageType::List => "LIST",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DISCOVER" => Ok(MessageType::Discover),
            "START" => Ok(MessageType::Start),
            "GET_TOOLS" => Ok(MessageType::GetTools),
            "CALL_TOOL" => Ok(MessageType::CallTool),
            "STOP" => Ok(MessageType::Stop),
            "LIST" => Ok(MessageType::List),
            _ => Err(SandboxError::invalid_request(format!("unknown message type '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub repository_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_readme: Option<String>,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub bootstrap_metadata: BootstrapMetadata,
}

/// Body of GET_TOOLS and STOP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRef {
    pub sandbox_id: SandboxId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// CALL_TOOL body: the sandbox id next to a JSON-RPC envelope forwarded
/// verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequest {
    pub sandbox_id: SandboxId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub message: JsonRpcMessage,
}

#[derive(Debug, Clone)]
pub enum SandboxRequest {
    Discover(DiscoverRequest),
    Start(StartRequest),
    GetTools(SandboxRef),
    CallTool(CallToolRequest),
    Stop(SandboxRef),
    List,
}

impl SandboxRequest {
    /// Decode a JSON body according to its message type.
    pub fn from_body(kind: MessageType, body: Value) -> Result<Self, SandboxError> {
        fn decode<T: serde::de::DeserializeOwned>(kind: MessageType, body: Value) -> Result<T, SandboxError> {
            serde_json::from_value(body)
                .map_err(|e| SandboxError::invalid_request(format!("malformed {} body: {}", kind, e)))
        }

        let request = match kind {
            MessageType::Discover => SandboxRequest::Discover(decode(kind, body)?),
            MessageType::Start => SandboxRequest::Start(decode(kind, body)?),
            MessageType::GetTools => SandboxRequest::GetTools(decode(kind, body)?),
            MessageType::CallTool => SandboxRequest::CallTool(decode(kind, body)?),
            MessageType::Stop => SandboxRequest::Stop(decode(kind, body)?),
            MessageType::List => SandboxRequest::List,
        };
        Ok(request)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            SandboxRequest::Discover(_) => MessageType::Discover,
            SandboxRequest::Start(_) => MessageType::Start,
            SandboxRequest::GetTools(_) => MessageType::GetTools,
            SandboxRequest::CallTool(_) => MessageType::CallTool,
            SandboxRequest::Stop(_) => MessageType::Stop,
            SandboxRequest::List => MessageType::List,
        }
    }
}

pub(crate) fn timeout_from_ms(timeout_ms: Option<u64>) -> Option<Duration> {
    timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SandboxResponse {
    Discovered {
        bootstrap_metadata: BootstrapMetadata,
    },
    Started {
        sandbox_id: SandboxId,
    },
    Tools {
        tools: Vec<Value>,
    },
    ToolResult {
        sandbox_id: SandboxId,
        response: JsonRpcMessage,
    },
    Stopped {},
    Sandboxes {
        sandboxes: Vec<Sandbox>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_message_types_leniently() {
        assert_eq!("GET_TOOLS".parse::<MessageType>().unwrap(), MessageType::GetTools);
        assert_eq!("call-tool".parse::<MessageType>().unwrap(), MessageType::CallTool);
        assert_eq!(" stop ".parse::<MessageType>().unwrap(), MessageType::Stop);
        assert!("RESTART".parse::<MessageType>().is_err());
    }

    #[test]
    fn call_tool_body_flattens_the_envelope() {
        let body = json!({
            "sandbox_id": "abc",
            "timeout_ms": 1500,
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "calculate", "arguments": {"expression": "1+1"}}
        });

        let SandboxRequest::CallTool(request) = SandboxRequest::from_body(MessageType::CallTool, body).unwrap() else {
            panic!("expected CALL_TOOL");
        };
        assert_eq!(request.sandbox_id, SandboxId::from("abc"));
        assert_eq!(request.timeout_ms, Some(1500));
        assert_eq!(request.message.method.as_deref(), Some("tools/call"));
        assert_eq!(request.message.id, Some(json!(3)));
        assert_eq!(request.message.params.unwrap()["name"], "calculate");
    }

    #[test]
    fn missing_fields_are_invalid_requests() {
        let err = SandboxRequest::from_body(MessageType::Stop, json!({})).unwrap_err();
        assert_eq!(err.kind(), "INVALID_REQUEST");
        assert!(err.to_string().contains("STOP"));
    }

    #[test]
    fn list_ignores_its_body() {
        assert!(matches!(
            SandboxRequest::from_body(MessageType::List, Value::Null).unwrap(),
            SandboxRequest::List
        ));
    }

    #[test]
    fn responses_serialize_to_plain_objects() {
        assert_eq!(serde_json::to_value(SandboxResponse::Stopped {}).unwrap(), json!({}));
        assert_eq!(
            serde_json::to_value(SandboxResponse::Started {
                sandbox_id: SandboxId::from("s-1")
            })
            .unwrap(),
            json!({"sandbox_id": "s-1"})
        );
    }
}
