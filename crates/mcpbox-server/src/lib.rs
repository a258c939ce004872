//! HTTP endpoint for the MCP sandbox broker
//!
//! Every broker operation goes through `POST /sandbox`; the operation is named
//! by the `X-Sandbox-Message-Type` header and its arguments travel as the JSON
//! body. `GET /health` reports liveness, Docker reachability and the number of
//! running sandboxes.

pub mod client;
pub mod error;

pub use client::{ClientError, SandboxClient};
pub use error::{ApiError, Result, ServerError};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, options, post};
use axum::{middleware, Router};
use mcpbox_core::config::ServerSettings;
use mcpbox_core::service::{MessageType, SandboxRequest, SandboxResponse};
use mcpbox_core::{SandboxError, SandboxService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Header naming the operation of a `POST /sandbox` request.
pub const MESSAGE_TYPE_HEADER: &str = "x-sandbox-message-type";
/// Older name of [`MESSAGE_TYPE_HEADER`], still accepted.
pub const LEGACY_MESSAGE_TYPE_HEADER: &str = "x-onemcp-message-type";

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub docker_available: bool,
    pub running_sandboxes: usize,
}

/// Configuration for the sandbox server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
            cors_origins: None,
            max_body_size: 2 * 1024 * 1024,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server configuration from the `server` section of the broker config.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        Ok(Self::default()
            .with_bind_addr_str(&settings.bind_addr)?
            .with_cors(settings.enable_cors)
            .with_max_body_size(settings.max_body_size)
            .with_logging(settings.enable_logging))
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address '{}': {}", addr, e)))?;
        Ok(self)
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SandboxService>,
    pub config: ServerConfig,
}

fn message_type_value(headers: &HeaderMap) -> Option<&axum::http::HeaderValue> {
    headers
        .get(MESSAGE_TYPE_HEADER)
        .or_else(|| headers.get(LEGACY_MESSAGE_TYPE_HEADER))
}

fn message_type(headers: &HeaderMap) -> std::result::Result<MessageType, SandboxError> {
    let value = message_type_value(headers)
        .ok_or_else(|| SandboxError::invalid_request("missing X-Sandbox-Message-Type header"))?;
    let value = value
        .to_str()
        .map_err(|_| SandboxError::invalid_request("X-Sandbox-Message-Type is not valid text"))?;
    value.parse()
}

fn parse_body(body: &[u8]) -> std::result::Result<Value, SandboxError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SandboxError::invalid_request(format!("body is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(SandboxError::invalid_request("body must be a JSON object"));
    }
    Ok(value)
}

/// Handler for the /sandbox POST endpoint.
async fn sandbox_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<SandboxResponse>, ApiError> {
    let kind = message_type(&headers)?;
    let request = SandboxRequest::from_body(kind, parse_body(&body)?)?;
    log::debug!("Dispatching {} request", kind);

    let response = app_state.service.handle(request).await?;
    Ok(Json(response))
}

/// Handler for the /health GET endpoint.
async fn health_handler(State(app_state): State<AppState>) -> Json<HealthResponse> {
    let docker_available = app_state.service.docker_available().await;
    Json(HealthResponse {
        status: if docker_available { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        docker_available,
        running_sandboxes: app_state.service.registry().running_count().await,
    })
}

/// The sandbox broker HTTP server.
pub struct SandboxServer {
    service: Arc<SandboxService>,
    config: ServerConfig,
}

impl SandboxServer {
    pub fn new(service: Arc<SandboxService>) -> Self {
        Self {
            service,
            config: ServerConfig::default(),
        }
    }

    pub fn with_config(service: Arc<SandboxService>, config: ServerConfig) -> Self {
        Self { service, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<SandboxService> {
        &self.service
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
            config: self.config.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/sandbox", post(sandbox_handler))
            .route("/sandbox", options(|| async { StatusCode::OK }))
            .with_state(state);

        router = router
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .layer(RequestBodyLimitLayer::new(self.config.max_body_size));

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();
                    let kind = message_type_value(request.headers())
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();

                    // Health checks are frequent
                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {} [{}]", request_id, method, uri, kind);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if uri.path() == "/health" {
                        log::debug!("Response {} completed in {:?}", request_id, duration);
                    } else {
                        log::info!(
                            "Response {} {} completed in {:?}",
                            request_id,
                            response.status(),
                            duration
                        );
                    }

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors_layer = if let Some(ref origins) = self.config.cors_origins {
                let origins: std::result::Result<Vec<_>, _> = origins.iter().map(|s| s.parse()).collect();
                match origins {
                    Ok(origins) => CorsLayer::new()
                        .allow_origin(origins)
                        .allow_methods(Any)
                        .allow_headers(Any),
                    Err(_) => CorsLayer::permissive(),
                }
            } else {
                CorsLayer::permissive()
            };
            router = router.layer(cors_layer);
        }

        router
    }

    async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            ServerError::config_error(format!("Failed to bind to {}: {}", self.config.bind_addr, e))
        })
    }

    /// Start the server and listen for connections until it fails.
    pub async fn serve(self) -> Result<()> {
        let listener = self.bind().await?;
        log::info!("Sandbox server starting on {}", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);
        log::info!("Sandbox endpoint: http://{}/sandbox", self.config.bind_addr);

        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))
    }

    /// Start the server with graceful shutdown support. Running sandboxes are
    /// stopped once the listener has drained.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        log::info!(
            "Sandbox server starting on {} with graceful shutdown",
            self.config.bind_addr
        );
        log::info!("Sandbox endpoint: http://{}/sandbox", self.config.bind_addr);

        let result = axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)));

        self.service.shutdown().await;
        log::info!("Sandbox server shut down gracefully");
        result
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
