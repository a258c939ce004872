use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use mcpbox_core::config::BrokerConfig;
use mcpbox_core::discovery::NoReadme;
use mcpbox_core::SandboxService;
use mcpbox_server::{SandboxServer, ServerConfig, MESSAGE_TYPE_HEADER};
use mcpbox_test_mocks::{InMemoryRuntime, ScriptedOracle, CALCULATOR_REPOSITORY, CALCULATOR_SETUP_SCRIPT};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

fn test_service(runtime: InMemoryRuntime) -> Arc<SandboxService> {
    let mut config = BrokerConfig::default();
    config.docker.ready_interval_ms = 10;
    config.docker.start_timeout_secs = 2;
    Arc::new(SandboxService::new(
        &config,
        Arc::new(ScriptedOracle::calculator()),
        Arc::new(NoReadme),
        Arc::new(runtime),
    ))
}

fn router(service: Arc<SandboxService>) -> Router {
    SandboxServer::with_config(service, ServerConfig::default()).build_router()
}

async fn post(app: &Router, kind: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sandbox")
                .header(MESSAGE_TYPE_HEADER, kind)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_reports_docker_and_running_count() {
    let app = router(test_service(InMemoryRuntime::new()));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["docker_available"], true);
    assert_eq!(body["running_sandboxes"], 0);

    let app = router(test_service(InMemoryRuntime::unavailable()));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["docker_available"], false);
}

#[tokio::test]
async fn calculator_scenario_over_http() {
    let service = test_service(InMemoryRuntime::new());
    let app = router(service.clone());

    let (status, body) = post(
        &app,
        "DISCOVER",
        json!({"repository_url": CALCULATOR_REPOSITORY, "repository_readme": "calculator"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bootstrap_metadata"]["setup_script"], CALCULATOR_SETUP_SCRIPT);

    let (status, body) = post(&app, "START", json!({"bootstrap_metadata": body["bootstrap_metadata"]})).await;
    assert_eq!(status, StatusCode::OK);
    let sandbox_id = body["sandbox_id"].as_str().unwrap().to_string();

    let (status, body) = post(&app, "GET_TOOLS", json!({"sandbox_id": sandbox_id})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .any(|tool| tool["name"] == "calculate"));

    let (status, body) = post(
        &app,
        "CALL_TOOL",
        json!({
            "sandbox_id": sandbox_id,
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "calculate", "arguments": {"expression": "0.5 + 0.25"}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sandbox_id"], sandbox_id.as_str());
    assert_eq!(body["response"]["result"]["structuredContent"]["result"], 0.75);

    let (status, body) = post(&app, "LIST", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sandboxes"].as_array().unwrap().len(), 1);

    let (status, body) = post(&app, "STOP", json!({"sandbox_id": sandbox_id})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, body) = post(
        &app,
        "CALL_TOOL",
        json!({"sandbox_id": sandbox_id, "jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "NOT_RUNNING");
}

#[tokio::test]
async fn request_errors_map_to_status_codes() {
    let app = router(test_service(InMemoryRuntime::new()));

    let (status, body) = post(&app, "REBOOT", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "INVALID_REQUEST");

    let (status, body) = post(&app, "GET_TOOLS", json!({"sandbox_id": "missing"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "UNKNOWN_SANDBOX");

    let (status, _) = post(&app, "STOP", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post(&app, "DISCOVER", json!({"repository_url": "not-a-url"})).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["kind"], "DISCOVERY_ERROR");

    let (status, body) = post(
        &app,
        "START",
        json!({"bootstrap_metadata": {
            "repository_url": CALCULATOR_REPOSITORY,
            "setup_script": "#!/bin/bash\n# mcpbox-test: fail-build\n"
        }}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "BUILD_ERROR");
    assert!(body["error"]["logs"].as_str().unwrap().contains("exit code 1"));
}

#[tokio::test]
async fn missing_header_and_bad_json_are_invalid_requests() {
    let app = router(test_service(InMemoryRuntime::new()));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sandbox")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sandbox")
                .header(MESSAGE_TYPE_HEADER, "START")
                .body(Body::from("{\"bootstrap_metadata\":"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["kind"], "INVALID_REQUEST");
}

#[tokio::test]
async fn list_accepts_an_empty_body() {
    let app = router(test_service(InMemoryRuntime::new()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sandbox")
                .header(MESSAGE_TYPE_HEADER, "LIST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"sandboxes": []}));
}

#[tokio::test]
async fn legacy_message_type_header_still_routes() {
    let app = router(test_service(InMemoryRuntime::new()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sandbox")
                .header("X-OneMCP-Message-Type", "LIST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"sandboxes": []}));
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let service = test_service(InMemoryRuntime::new());
    let app = SandboxServer::with_config(service, ServerConfig::default().with_max_body_size(64)).build_router();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sandbox")
                .header(MESSAGE_TYPE_HEADER, "DISCOVER")
                .body(Body::from(
                    json!({"repository_url": CALCULATOR_REPOSITORY, "repository_readme": "x".repeat(512)})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
