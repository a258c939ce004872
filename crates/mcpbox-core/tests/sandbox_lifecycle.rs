use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use mcpbox_core::config::BrokerConfig;
use mcpbox_core::discovery::NoReadme;
use mcpbox_core::service::{MessageType, SandboxRequest, SandboxResponse, SandboxService};
use mcpbox_core::{BootstrapMetadata, JsonRpcMessage, SandboxId, SandboxState, TransportKind};
use mcpbox_test_mocks::{
    InMemoryRuntime, ScriptedOracle, ServerBehavior, BUILD_FAILURE_MARKER, CALCULATOR_REPOSITORY,
    CALCULATOR_SETUP_SCRIPT,
};
use serde_json::{json, Value};

fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.docker.ready_attempts = 5;
    config.docker.ready_interval_ms = 10;
    config.docker.start_timeout_secs = 2;
    config.docker.stop_grace_secs = 1;
    config.limits.call_timeout_secs = 5;
    config
}

fn service_with(config: &BrokerConfig, runtime: Arc<InMemoryRuntime>) -> SandboxService {
    SandboxService::new(
        config,
        Arc::new(ScriptedOracle::calculator()),
        Arc::new(NoReadme),
        runtime,
    )
}

fn calculator_metadata() -> BootstrapMetadata {
    BootstrapMetadata::new(CALCULATOR_REPOSITORY, CALCULATOR_SETUP_SCRIPT)
}

fn call(name: &str, arguments: Value) -> JsonRpcMessage {
    JsonRpcMessage::request(
        json!(format!("req-{}", name)),
        "tools/call",
        Some(json!({ "name": name, "arguments": arguments })),
    )
}

fn structured_result(response: &JsonRpcMessage) -> Value {
    response.result.as_ref().expect("tool call result")["structuredContent"]["result"].clone()
}

#[tokio::test]
async fn calculator_round_trip_over_stdio() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let id = service.start(calculator_metadata()).await.unwrap();
    assert_eq!(service.registry().state(&id).await, Some(SandboxState::Running));

    let tools = service.get_tools(&id, None).await.unwrap();
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(names, vec!["calculate", "echo", "sleep", "crash"]);

    let response = service
        .call_tool(&id, call("calculate", json!({"expression": "0.5 + 0.25"})), None)
        .await
        .unwrap();
    assert_eq!(response.id, Some(json!("req-calculate")));
    assert_eq!(structured_result(&response), json!(0.75));

    service.stop(&id).await.unwrap();
    assert_eq!(service.registry().state(&id).await, Some(SandboxState::Stopped));
    assert_eq!(runtime.container_count(), 0);

    let err = service
        .call_tool(&id, call("calculate", json!({"expression": "1 + 1"})), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NOT_RUNNING");
}

#[tokio::test]
async fn dispatches_typed_requests() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime);

    let discovered = service
        .handle(
            SandboxRequest::from_body(
                MessageType::Discover,
                json!({"repository_url": CALCULATOR_REPOSITORY, "repository_readme": "# calculator"}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let SandboxResponse::Discovered { bootstrap_metadata } = discovered else {
        panic!("expected discovery response");
    };
    assert_eq!(bootstrap_metadata.run_command, "/run_mcp.sh");

    let started = service
        .handle(
            SandboxRequest::from_body(MessageType::Start, json!({ "bootstrap_metadata": bootstrap_metadata }))
                .unwrap(),
        )
        .await
        .unwrap();
    let SandboxResponse::Started { sandbox_id } = started else {
        panic!("expected start response");
    };

    let result = service
        .handle(
            SandboxRequest::from_body(
                MessageType::CallTool,
                json!({
                    "sandbox_id": sandbox_id,
                    "jsonrpc": "2.0",
                    "id": 7,
                    "method": "tools/call",
                    "params": {"name": "calculate", "arguments": {"expression": "6 * 7"}}
                }),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let body = serde_json::to_value(&result).unwrap();
    assert_eq!(body["sandbox_id"], json!(sandbox_id));
    assert_eq!(body["response"]["id"], json!(7));
    assert_eq!(body["response"]["result"]["structuredContent"]["result"], json!(42.0));

    let listed = service.handle(SandboxRequest::List).await.unwrap();
    let body = serde_json::to_value(&listed).unwrap();
    assert_eq!(body["sandboxes"][0]["state"], "RUNNING");

    let stopped = service
        .handle(SandboxRequest::from_body(MessageType::Stop, json!({ "sandbox_id": sandbox_id })).unwrap())
        .await
        .unwrap();
    assert_eq!(serde_json::to_value(&stopped).unwrap(), json!({}));
}

#[tokio::test]
async fn stop_is_idempotent_and_unknown_ids_are_rejected() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let id = service.start(calculator_metadata()).await.unwrap();
    service.stop(&id).await.unwrap();
    service.stop(&id).await.unwrap();
    assert_eq!(runtime.stop_count(), 1);

    let unknown = SandboxId::from("no-such-sandbox");
    assert_eq!(service.stop(&unknown).await.unwrap_err().kind(), "UNKNOWN_SANDBOX");
    assert_eq!(service.get_tools(&unknown, None).await.unwrap_err().kind(), "UNKNOWN_SANDBOX");
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_response() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime);
    let id = service.start(calculator_metadata()).await.unwrap();

    let calls = (0..16).map(|n| {
        let request = JsonRpcMessage::request(
            json!(format!("echo-{}", n)),
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"n": n}})),
        );
        service.call_tool(&id, request, None)
    });
    let responses = join_all(calls).await;

    for (n, response) in responses.into_iter().enumerate() {
        let response = response.unwrap();
        assert_eq!(response.id, Some(json!(format!("echo-{}", n))));
        assert_eq!(structured_result(&response), json!({"n": n}));
    }
}

#[tokio::test]
async fn envelope_without_id_gets_one_assigned() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime);
    let id = service.start(calculator_metadata()).await.unwrap();

    let mut request = call("calculate", json!({"expression": "2 - 3"}));
    request.id = None;
    let response = service.call_tool(&id, request, None).await.unwrap();
    assert!(response.id.unwrap().as_str().unwrap().starts_with("mcpbox-"));

    let mut missing_method = call("calculate", json!({}));
    missing_method.method = None;
    let err = service.call_tool(&id, missing_method, None).await.unwrap_err();
    assert_eq!(err.kind(), "INVALID_REQUEST");
}

#[tokio::test]
async fn server_errors_are_returned_not_raised() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime);
    let id = service.start(calculator_metadata()).await.unwrap();

    let response = service
        .call_tool(&id, call("no-such-tool", json!({})), None)
        .await
        .unwrap();
    assert_eq!(response.error.unwrap()["code"], json!(-32602));
    assert_eq!(service.registry().state(&id).await, Some(SandboxState::Running));
}

#[tokio::test]
async fn call_timeout_leaves_sandbox_usable() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime);
    let id = service.start(calculator_metadata()).await.unwrap();

    let err = service
        .call_tool(&id, call("sleep", json!({"ms": 300})), Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "TRANSPORT_TIMEOUT");
    assert_eq!(service.registry().state(&id).await, Some(SandboxState::Running));

    let response = service
        .call_tool(&id, call("calculate", json!({"expression": "(1 + 2) * 3"})), None)
        .await
        .unwrap();
    assert_eq!(structured_result(&response), json!(9.0));
}

#[tokio::test]
async fn build_failure_registers_nothing() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let script = format!("{}\n{}\n", CALCULATOR_SETUP_SCRIPT, BUILD_FAILURE_MARKER);
    let err = service
        .start(BootstrapMetadata::new(CALCULATOR_REPOSITORY, script))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "BUILD_ERROR");
    assert!(err.build_logs().unwrap().contains("exit code 1"));
    assert!(service.list().await.is_empty());
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn invalid_metadata_is_rejected_before_building() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let err = service
        .start(BootstrapMetadata::new("not a repository", CALCULATOR_SETUP_SCRIPT))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVALID_REQUEST");

    let err = service
        .start(BootstrapMetadata::new(CALCULATOR_REPOSITORY, "   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVALID_REQUEST");
    assert_eq!(runtime.build_count(), 0);
}

#[tokio::test]
async fn silent_server_fails_the_handshake_and_leaves_no_container() {
    let runtime = Arc::new(InMemoryRuntime::new().with_behavior(ServerBehavior::Silent));
    let mut config = test_config();
    config.docker.start_timeout_secs = 1;
    let service = service_with(&config, runtime.clone());

    let err = service.start(calculator_metadata()).await.unwrap_err();
    assert_eq!(err.kind(), "START_ERROR");
    assert!(service.list().await.is_empty());
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn exiting_server_fails_to_start() {
    let runtime = Arc::new(InMemoryRuntime::new().with_behavior(ServerBehavior::Exit));
    let service = service_with(&test_config(), runtime.clone());

    let err = service.start(calculator_metadata()).await.unwrap_err();
    assert_eq!(err.kind(), "START_ERROR");
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn container_creation_failure_is_a_start_error() {
    let runtime = Arc::new(InMemoryRuntime::new());
    runtime.fail_runs(true);
    let service = service_with(&test_config(), runtime.clone());

    let err = service.start(calculator_metadata()).await.unwrap_err();
    assert_eq!(err.kind(), "START_ERROR");
    assert!(service.list().await.is_empty());
}

#[tokio::test]
async fn banner_lines_on_stdout_are_ignored() {
    let runtime = Arc::new(InMemoryRuntime::new().with_behavior(ServerBehavior::Chatty));
    let service = service_with(&test_config(), runtime);

    let id = service.start(calculator_metadata()).await.unwrap();
    let tools = service.get_tools(&id, None).await.unwrap();
    assert_eq!(tools.len(), 4);
}

#[tokio::test]
async fn crashed_server_marks_sandbox_failed() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());
    let id = service.start(calculator_metadata()).await.unwrap();

    let err = service.call_tool(&id, call("crash", json!({})), None).await.unwrap_err();
    assert_eq!(err.kind(), "TRANSPORT_IO");
    assert_eq!(service.registry().state(&id).await, Some(SandboxState::Failed));
    assert_eq!(runtime.container_count(), 0);

    let err = service.get_tools(&id, None).await.unwrap_err();
    assert_eq!(err.kind(), "NOT_RUNNING");
    service.stop(&id).await.unwrap();
}

#[tokio::test]
async fn killed_container_is_detected_on_next_call() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());
    let id = service.start(calculator_metadata()).await.unwrap();

    let name = service.lifecycle().container_name(&id);
    assert!(runtime.kill(&name));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = service.get_tools(&id, None).await.unwrap_err();
    assert_eq!(err.kind(), "TRANSPORT_IO");
    assert_eq!(service.registry().state(&id).await, Some(SandboxState::Failed));
}

#[tokio::test]
async fn one_container_per_sandbox() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let first = service.start(calculator_metadata()).await.unwrap();
    let second = service.start(calculator_metadata()).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(runtime.container_count(), 2);
    assert_eq!(
        runtime.container_names(),
        {
            let mut names = vec![
                service.lifecycle().container_name(&first),
                service.lifecycle().container_name(&second),
            ];
            names.sort();
            names
        }
    );
    // same metadata, same image
    assert_eq!(runtime.build_count(), 1);

    service.stop(&first).await.unwrap();
    assert_eq!(runtime.container_count(), 1);
    let response = service
        .call_tool(&second, call("calculate", json!({"expression": "1 / 4"})), None)
        .await
        .unwrap();
    assert_eq!(structured_result(&response), json!(0.25));
}

#[tokio::test]
async fn capacity_limit_counts_running_sandboxes() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let mut config = test_config();
    config.limits.max_sandboxes = Some(1);
    let service = service_with(&config, runtime);

    let first = service.start(calculator_metadata()).await.unwrap();
    let err = service.start(calculator_metadata()).await.unwrap_err();
    assert_eq!(err.kind(), "CAPACITY_EXCEEDED");

    service.stop(&first).await.unwrap();
    service.start(calculator_metadata()).await.unwrap();
}

#[tokio::test]
async fn network_transport_round_trip() {
    for runtime in [InMemoryRuntime::new(), InMemoryRuntime::new().with_sse()] {
        let runtime = Arc::new(runtime);
        let service = service_with(&test_config(), runtime.clone());
        let metadata = calculator_metadata().with_transport(TransportKind::Network);

        let id = service.start(metadata).await.unwrap();
        let sandbox = service.registry().get(&id).await.unwrap();
        assert_eq!(sandbox.transport_kind, TransportKind::Network);
        assert_eq!(sandbox.server_info.unwrap()["name"], "mcp-server-calculator");

        let tools = service.get_tools(&id, None).await.unwrap();
        assert_eq!(tools.len(), 4);

        let response = service
            .call_tool(&id, call("calculate", json!({"expression": "0.5 + 0.25"})), None)
            .await
            .unwrap();
        assert_eq!(structured_result(&response), json!(0.75));

        service.stop(&id).await.unwrap();
        assert_eq!(runtime.container_count(), 0);
    }
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let ids = vec![
        service.start(calculator_metadata()).await.unwrap(),
        service.start(calculator_metadata()).await.unwrap(),
    ];
    service.shutdown().await;

    for id in &ids {
        assert_eq!(service.registry().state(id).await, Some(SandboxState::Stopped));
    }
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn sweep_removes_only_unowned_containers() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let id = service.start(calculator_metadata()).await.unwrap();
    runtime.add_orphan("mcpbox-leftover", "previous-run");

    assert_eq!(service.sweep_orphans().await, 1);
    assert_eq!(runtime.container_names(), vec![service.lifecycle().container_name(&id)]);
    assert_eq!(service.registry().state(&id).await, Some(SandboxState::Running));
}

#[tokio::test]
async fn stop_waits_for_in_flight_call_and_rejects_late_ones() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = Arc::new(service_with(&test_config(), runtime.clone()));
    let id = service.start(calculator_metadata()).await.unwrap();

    let in_flight = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.call_tool(&id, call("sleep", json!({"ms": 300})), None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let stopping = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.stop(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let late = service
        .call_tool(&id, call("calculate", json!({"expression": "1 + 1"})), None)
        .await
        .unwrap_err();
    assert_eq!(late.kind(), "NOT_RUNNING");

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(structured_result(&response), json!(300));
    stopping.await.unwrap().unwrap();

    assert_eq!(service.registry().state(&id).await, Some(SandboxState::Stopped));
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn started_sandbox_is_registered_running_and_stoppable_immediately() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let id = service.start(calculator_metadata()).await.unwrap();
    assert!(service
        .list()
        .await
        .iter()
        .all(|sandbox| sandbox.state == SandboxState::Running));

    service.stop(&id).await.unwrap();
    assert_eq!(runtime.container_count(), 0);
}

async fn wait_for_no_containers(runtime: &InMemoryRuntime) {
    for _ in 0..100 {
        if runtime.container_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("containers left behind: {:?}", runtime.container_names());
}

#[tokio::test]
async fn cancelled_start_leaves_no_container_behind() {
    // Cancelled while the container is being created, then during the handshake
    let runtimes = [
        InMemoryRuntime::new().with_start_delay(Duration::from_secs(5)),
        InMemoryRuntime::new().with_behavior(ServerBehavior::Silent),
    ];
    for runtime in runtimes {
        let runtime = Arc::new(runtime);
        let service = service_with(&test_config(), runtime.clone());

        let outcome = tokio::time::timeout(Duration::from_millis(200), service.start(calculator_metadata())).await;
        assert!(outcome.is_err());

        wait_for_no_containers(&runtime).await;
        assert!(service.list().await.is_empty());
        assert!(service.registry().live_ids().await.is_empty());
    }
}

#[tokio::test]
async fn slow_container_start_times_out_without_leaking() {
    let runtime = Arc::new(InMemoryRuntime::new().with_start_delay(Duration::from_secs(3)));
    let mut config = test_config();
    config.docker.start_timeout_secs = 1;
    let service = service_with(&config, runtime.clone());

    let err = service.start(calculator_metadata()).await.unwrap_err();
    assert_eq!(err.kind(), "START_ERROR");
    assert_eq!(runtime.container_count(), 0);
    assert!(service.list().await.is_empty());
}

#[tokio::test]
async fn sweep_prunes_images_no_sandbox_uses() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let mut config = test_config();
    config.docker.prune_images_on_sweep = true;
    let service = service_with(&config, runtime.clone());

    let kept = service.start(calculator_metadata()).await.unwrap();
    let mut stale = calculator_metadata();
    stale.setup_script.push_str("\necho stale");
    let dropped = service.start(stale).await.unwrap();
    service.stop(&dropped).await.unwrap();
    runtime.add_image("unrelated/app:latest");
    assert_eq!(runtime.image_count(), 3);

    service.sweep_orphans().await;

    let kept_image = service.registry().get(&kept).await.unwrap().image;
    let dropped_image = service.registry().get(&dropped).await.unwrap().image;
    assert!(runtime.has_image(&kept_image));
    assert!(!runtime.has_image(&dropped_image));
    assert!(runtime.has_image("unrelated/app:latest"));
}

#[tokio::test]
async fn images_are_kept_unless_pruning_is_enabled() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = service_with(&test_config(), runtime.clone());

    let id = service.start(calculator_metadata()).await.unwrap();
    service.stop(&id).await.unwrap();
    service.sweep_orphans().await;
    assert_eq!(runtime.image_count(), 1);

    assert_eq!(service.prune_images().await, 1);
    assert_eq!(runtime.image_count(), 0);
}
