use std::sync::Arc;

use mcpbox_core::config::BrokerConfig;
use mcpbox_core::discovery::NoReadme;
use mcpbox_core::{JsonRpcMessage, SandboxId, SandboxService, SandboxState};
use mcpbox_server::{SandboxClient, SandboxServer, ServerConfig};
use mcpbox_test_mocks::{InMemoryRuntime, ScriptedOracle, CALCULATOR_REPOSITORY};
use serde_json::json;
use tokio::net::TcpListener;

/// Serves the router on an ephemeral port and returns its base URL.
async fn spawn_server() -> (String, tokio::sync::oneshot::Sender<()>) {
    let mut config = BrokerConfig::default();
    config.docker.ready_interval_ms = 10;
    let service = Arc::new(SandboxService::new(
        &config,
        Arc::new(ScriptedOracle::calculator()),
        Arc::new(NoReadme),
        Arc::new(InMemoryRuntime::new()),
    ));
    let app = SandboxServer::with_config(service, ServerConfig::default()).build_router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
            .unwrap();
    });
    (format!("http://{}", addr), shutdown_tx)
}

#[tokio::test]
async fn client_drives_a_sandbox_end_to_end() {
    let (base_url, _shutdown) = spawn_server().await;
    let client = SandboxClient::new(base_url);

    let health = client.health().await.unwrap();
    assert!(health.docker_available);

    let metadata = client.discover(CALCULATOR_REPOSITORY, Some("readme")).await.unwrap();
    let sandbox_id = client.start(&metadata).await.unwrap();

    let tools = client.get_tools(&sandbox_id).await.unwrap();
    assert_eq!(tools.len(), 4);

    let response = client
        .call_tool(
            &sandbox_id,
            &JsonRpcMessage::request(
                json!("calc-1"),
                "tools/call",
                Some(json!({"name": "calculate", "arguments": {"expression": "10 / 4"}})),
            ),
        )
        .await
        .unwrap();
    assert_eq!(response.id, Some(json!("calc-1")));
    assert_eq!(response.result.unwrap()["structuredContent"]["result"], 2.5);

    let sandboxes = client.list().await.unwrap();
    assert_eq!(sandboxes.len(), 1);
    assert_eq!(sandboxes[0].state, SandboxState::Running);

    client.stop(&sandbox_id).await.unwrap();
    client.stop(&sandbox_id).await.unwrap();
    assert_eq!(client.list().await.unwrap()[0].state, SandboxState::Stopped);
}

#[tokio::test]
async fn client_surfaces_error_kinds() {
    let (base_url, _shutdown) = spawn_server().await;
    let client = SandboxClient::new(base_url);

    let err = client.stop(&SandboxId::from("nope")).await.unwrap_err();
    assert_eq!(err.kind(), Some("UNKNOWN_SANDBOX"));
    assert!(err.to_string().contains("404"));
}
