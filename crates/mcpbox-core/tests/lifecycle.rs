use std::collections::HashSet;
use std::sync::Arc;

use mcpbox_core::config::DockerSettings;
use mcpbox_core::lifecycle::{image, LifecycleManager};
use mcpbox_core::{BootstrapMetadata, SandboxId, TransportKind};
use mcpbox_test_mocks::{InMemoryRuntime, BUILD_FAILURE_MARKER, CALCULATOR_REPOSITORY, CALCULATOR_SETUP_SCRIPT};

fn settings() -> DockerSettings {
    DockerSettings {
        ready_attempts: 3,
        ready_interval_ms: 10,
        start_timeout_secs: 2,
        stop_grace_secs: 1,
        ..DockerSettings::default()
    }
}

fn metadata() -> BootstrapMetadata {
    BootstrapMetadata::new(CALCULATOR_REPOSITORY, CALCULATOR_SETUP_SCRIPT)
}

#[tokio::test]
async fn builds_once_and_reuses_the_image() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(runtime.clone(), settings());

    let first = manager.build(&metadata()).await.unwrap();
    let second = manager.build(&metadata()).await.unwrap();
    assert_eq!(first.tag, second.tag);
    assert!(first.id.is_some());
    assert_eq!(runtime.build_count(), 1);

    let build = &runtime.builds()[0];
    assert_eq!(build.setup_script, CALCULATOR_SETUP_SCRIPT);
    assert!(build.dockerfile.starts_with("FROM ubuntu:22.04"));
    assert!(build.dockerfile.contains(image::SETUP_SCRIPT_PATH));
}

#[tokio::test]
async fn disabling_reuse_rebuilds() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(
        runtime.clone(),
        DockerSettings {
            reuse_images: false,
            ..settings()
        },
    );

    manager.build(&metadata()).await.unwrap();
    manager.build(&metadata()).await.unwrap();
    assert_eq!(runtime.build_count(), 2);
}

#[tokio::test]
async fn failed_build_produces_no_image() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(runtime.clone(), settings());

    let broken = BootstrapMetadata::new(CALCULATOR_REPOSITORY, BUILD_FAILURE_MARKER);
    let err = manager.build(&broken).await.unwrap_err();
    assert!(err.reason.contains("non-zero code"));
    assert!(err.logs.contains("Step: FROM"));

    let tag = image::image_tag(&settings().image_prefix, &settings().base_image, &broken);
    assert!(!runtime.has_image(&tag));
}

#[tokio::test]
async fn dropped_guard_removes_the_container() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(runtime.clone(), settings());
    let image = manager.build(&metadata()).await.unwrap();

    let guard = manager.start(&SandboxId::new(), &image, &metadata()).await.unwrap();
    assert_eq!(runtime.container_count(), 1);
    drop(guard);

    for _ in 0..50 {
        if runtime.container_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn committed_guard_keeps_the_container_until_stopped() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(runtime.clone(), settings());
    let image = manager.build(&metadata()).await.unwrap();
    let id = SandboxId::new();

    let mut guard = manager.start(&id, &image, &metadata()).await.unwrap();
    assert!(guard.take_stdio().is_some());
    let handle = guard.commit();
    assert_eq!(handle.name, manager.container_name(&id));
    tokio::task::yield_now().await;
    assert_eq!(runtime.container_count(), 1);

    manager.stop(handle).await.unwrap();
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.stop_count(), 1);
}

#[tokio::test]
async fn network_containers_report_their_published_port() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(runtime.clone(), settings());
    let metadata = metadata().with_transport(TransportKind::Network);
    let image = manager.build(&metadata).await.unwrap();

    let mut guard = manager.start(&SandboxId::new(), &image, &metadata).await.unwrap();
    assert!(guard.take_stdio().is_none());
    assert!(guard.handle().published_port.is_some());
    assert_eq!(guard.handle().host, "127.0.0.1");
    guard.release().await;
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn unknown_image_fails_to_start() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(runtime.clone(), settings());
    let image = mcpbox_core::types::ImageRef {
        tag: "mcpbox-sandbox:missing".to_string(),
        id: None,
    };

    assert!(manager.start(&SandboxId::new(), &image, &metadata()).await.is_err());
    assert_eq!(runtime.container_count(), 0);
}

#[tokio::test]
async fn sweep_keeps_live_sandboxes() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(runtime.clone(), settings());

    runtime.add_orphan("mcpbox-alive", "alive");
    runtime.add_orphan("mcpbox-dead", "dead");
    let live: HashSet<SandboxId> = [SandboxId::from("alive")].into_iter().collect();

    assert_eq!(manager.sweep_orphans(&live).await.unwrap(), 1);
    assert_eq!(runtime.container_names(), vec!["mcpbox-alive".to_string()]);
}

#[tokio::test]
async fn sweep_reports_an_unreachable_runtime() {
    let manager = LifecycleManager::new(Arc::new(InMemoryRuntime::unavailable()), settings());
    assert!(manager.sweep_orphans(&HashSet::new()).await.is_err());
}

#[tokio::test]
async fn start_timeout_removes_the_created_container_by_name() {
    let runtime = Arc::new(InMemoryRuntime::new().with_start_delay(std::time::Duration::from_secs(3)));
    let manager = LifecycleManager::new(
        runtime.clone(),
        DockerSettings {
            start_timeout_secs: 1,
            ..settings()
        },
    );
    let image = manager.build(&metadata()).await.unwrap();

    let err = manager.start(&SandboxId::new(), &image, &metadata()).await.unwrap_err();
    assert!(matches!(err, mcpbox_core::errors::StartError::Timeout(_)));
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.stop_count(), 1);
}

#[tokio::test]
async fn prune_keeps_images_in_use() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = LifecycleManager::new(runtime.clone(), settings());

    let running = manager.build(&metadata()).await.unwrap();
    let guard = manager.start(&SandboxId::new(), &running, &metadata()).await.unwrap();

    let mut other = metadata();
    other.run_command = "/opt/other.sh".to_string();
    let unused = manager.build(&other).await.unwrap();
    let registered = {
        let mut third = metadata();
        third.setup_script.push_str("\necho third");
        manager.build(&third).await.unwrap()
    };
    runtime.add_image("python:3.12-slim");

    let in_use: HashSet<String> = [registered.tag.clone()].into_iter().collect();
    assert_eq!(manager.prune_images(&in_use).await.unwrap(), 1);

    assert!(runtime.has_image(&running.tag));
    assert!(runtime.has_image(&registered.tag));
    assert!(!runtime.has_image(&unused.tag));
    assert!(runtime.has_image("python:3.12-slim"));
    guard.release().await;
}
