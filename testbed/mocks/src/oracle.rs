//! Bootstrap oracle doubles: an in-process scripted oracle and a mock
//! OpenAI-compatible chat completion server.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use mcpbox_core::discovery::BootstrapOracle;
use mcpbox_core::errors::DiscoveryError;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Setup script for the calculator server, as an oracle would write it.
pub const CALCULATOR_SETUP_SCRIPT: &str = r#"#!/bin/bash
set -e

apt-get update
apt-get install -y git python3 python3-pip python3-venv

git clone https://github.com/githejie/mcp-server-calculator
cd mcp-server-calculator

python3 -m venv venv
source venv/bin/activate
pip install mcp-server-calculator

cat <<EOL > /run_mcp.sh
#!/bin/bash
source $(pwd)/venv/bin/activate
python3 -m mcp_server_calculator
EOL

chmod +x /run_mcp.sh"#;

pub const CALCULATOR_REPOSITORY: &str = "https://github.com/githejie/mcp-server-calculator";

/// Oracle returning canned answers in order (the last one repeats).
pub struct ScriptedOracle {
    answers: Mutex<VecDeque<Result<String, DiscoveryError>>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedOracle {
    pub fn new(answers: Vec<Result<String, DiscoveryError>>) -> Self {
        Self {
            answers: Mutex::new(VecDeque::from(answers)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn answering(answer: &str) -> Self {
        Self::new(vec![Ok(answer.to_string())])
    }

    pub fn calculator() -> Self {
        Self::answering(&format!("```bash\n{}\n```", CALCULATOR_SETUP_SCRIPT))
    }

    pub fn failing(message: &str) -> Self {
        Self::new(vec![Err(DiscoveryError::Oracle(message.to_string()))])
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// `(system_prompt, prompt)` pairs received so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl BootstrapOracle for ScriptedOracle {
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String, DiscoveryError> {
        self.prompts
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), prompt.to_string()));

        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            answers.pop_front().unwrap()
        } else {
            answers
                .front()
                .cloned()
                .unwrap_or_else(|| Err(DiscoveryError::Oracle("no scripted answer".to_string())))
        }
    }
}

#[derive(Clone)]
struct ChatState {
    responses: Arc<Mutex<VecDeque<(StatusCode, Value)>>>,
    requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn chat_completions_handler(
    State(state): State<ChatState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    state.requests.lock().unwrap().push((auth, payload));

    match state.responses.lock().unwrap().pop_front() {
        Some((status, body)) => (status, Json(body)),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"message": "mock chat server ran out of responses"}})),
        ),
    }
}

/// Mock OpenAI-compatible server answering `/v1/chat/completions`.
pub struct MockChatServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

impl MockChatServer {
    pub async fn start(responses: Vec<(StatusCode, Value)>) -> Self {
        let state = ChatState {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let requests = state.requests.clone();

        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions_handler))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap_or_else(|e| {
            panic!("Failed to bind mock chat server to 127.0.0.1:0. Error: {}", e);
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| log::error!("Mock chat server error: {}", e));
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            requests,
        }
    }

    /// A successful completion whose message content is `content`.
    pub fn completion(content: &str) -> (StatusCode, Value) {
        (
            StatusCode::OK,
            json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": content},
                    "finish_reason": "stop"
                }]
            }),
        )
    }

    /// Base URL to configure as the oracle's `api_base`.
    pub fn api_base(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    /// `(authorization header, body)` of every request received.
    pub fn requests(&self) -> Vec<(Option<String>, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockChatServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
