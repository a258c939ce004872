//! README source doubles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use mcpbox_core::discovery::{ReadmeSource, RepositoryRef};
use mcpbox_core::errors::DiscoveryError;
use tokio::net::TcpListener;

/// Returns the same README for every repository and counts fetches.
pub struct StaticReadme {
    text: String,
    fetched: Mutex<Vec<String>>,
}

impl StaticReadme {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Slugs of the repositories fetched so far.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReadmeSource for StaticReadme {
    async fn fetch(&self, repository: &RepositoryRef) -> Result<String, DiscoveryError> {
        self.fetched.lock().unwrap().push(repository.slug());
        Ok(self.text.clone())
    }
}

#[derive(Clone)]
struct GitHubState {
    readmes: Arc<HashMap<String, String>>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
}

async fn readme_handler(
    State(state): State<GitHubState>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    state.headers.lock().unwrap().push(headers);
    match state.readmes.get(&format!("{}/{}", owner, repo)) {
        Some(text) => (StatusCode::OK, text.clone()),
        None => (StatusCode::NOT_FOUND, r#"{"message":"Not Found"}"#.to_string()),
    }
}

/// Mock of the GitHub `GET /repos/{owner}/{repo}/readme` endpoint.
pub struct MockGitHubServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
}

impl MockGitHubServer {
    /// `readmes` maps `owner/repo` to README text.
    pub async fn start(readmes: HashMap<String, String>) -> Self {
        let state = GitHubState {
            readmes: Arc::new(readmes),
            headers: Arc::new(Mutex::new(Vec::new())),
        };
        let headers = state.headers.clone();

        let app = Router::new()
            .route("/repos/{owner}/{repo}/readme", get(readme_handler))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap_or_else(|e| {
            panic!("Failed to bind mock GitHub server to 127.0.0.1:0. Error: {}", e);
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| log::error!("Mock GitHub server error: {}", e));
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            headers,
        }
    }

    pub fn api_base(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Request headers of every call received.
    pub fn received_headers(&self) -> Vec<HeaderMap> {
        self.headers.lock().unwrap().clone()
    }
}

impl Drop for MockGitHubServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
