//! Mock MCP streamable HTTP server wrapping the calculator.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use mcpbox_core::types::JsonRpcMessage;
use tokio::net::TcpListener;

use crate::calculator::{respond, Reply};

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
struct HttpState {
    sse: bool,
    session: String,
    requests: Arc<Mutex<Vec<(Option<String>, JsonRpcMessage)>>>,
}

async fn mcp_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(message): Json<JsonRpcMessage>,
) -> Response {
    let session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    state.requests.lock().unwrap().push((session.clone(), message.clone()));

    let initializing = message.method.as_deref() == Some("initialize");
    if !initializing && session.as_deref() != Some(state.session.as_str()) {
        return (StatusCode::BAD_REQUEST, "missing or unknown session").into_response();
    }

    let reply = match respond(&message).await {
        Reply::Message(reply) => reply,
        Reply::Nothing => return StatusCode::ACCEPTED.into_response(),
        Reply::Exit => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let mut response = if state.sse {
        let data = serde_json::to_string(&reply).unwrap_or_default();
        let stream = async_stream::stream! {
            yield Ok::<_, std::convert::Infallible>(Event::default().comment("stream opened"));
            yield Ok(Event::default().event("message").data(data));
        };
        Sse::new(stream).into_response()
    } else {
        Json(reply).into_response()
    };

    if initializing {
        if let Ok(value) = state.session.parse() {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    response
}

pub struct MockMcpHttpServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    requests: Arc<Mutex<Vec<(Option<String>, JsonRpcMessage)>>>,
}

impl MockMcpHttpServer {
    /// Serve on `127.0.0.1:0`. With `sse` set, responses are event streams.
    pub async fn start(sse: bool) -> Self {
        let state = HttpState {
            sse,
            session: uuid::Uuid::new_v4().to_string(),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let requests = state.requests.clone();

        let app = Router::new().route("/mcp", post(mcp_handler)).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap_or_else(|e| {
            panic!("Failed to bind mock MCP server to 127.0.0.1:0. Error: {}", e);
        });
        let addr = listener.local_addr().unwrap();
        log::info!("Mock MCP HTTP server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| log::error!("Mock MCP HTTP server error: {}", e));
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            requests,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    /// Methods received so far, with the session id each carried.
    pub fn requests(&self) -> Vec<(Option<String>, JsonRpcMessage)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockMcpHttpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
