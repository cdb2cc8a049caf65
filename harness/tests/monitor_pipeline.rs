//! Integration tests for the monitor controller pipeline
//!
//! These drive a real event bus, registry and timeout manager with mocked
//! collaborators on a paused clock.

mod common;

use std::time::Duration;

use common::{ControllerBuilder, TestFixtures, TestHelpers, TestScope};
use harness::MonitorState;
use serde_json::json;
use shared::event_types::*;

#[tokio::test(start_paused = true)]
async fn test_ready_instance_produces_readiness_chain() {
    let scope = TestScope::new();
    let controller = ControllerBuilder::new()
        .with_batch(vec![TestFixtures::running(TestFixtures::INSTANCE_1)])
        .build(&scope);
    controller.start().unwrap();

    let id = Some(TestFixtures::INSTANCE_1);
    let ready = scope.expect(INSTANCE_READY, id).await;
    let ssh = scope.expect(SSH_READY, id).await;
    let http = scope.expect(HTTP_READY, id).await;

    assert_eq!(ready.get("state"), Some(&json!("running")));
    assert_eq!(ready.get("image_id"), Some(&json!(TestFixtures::IMAGE_ID)));
    assert_eq!(ssh.get("port"), Some(&json!(20000)));
    assert!(ssh.get("key_file").is_some());
    assert_eq!(http.get("container_id"), Some(&json!(format!("ctr-{}", TestFixtures::INSTANCE_1))));
    assert!(ready.published_at() <= ssh.published_at());
    assert!(ssh.published_at() <= http.published_at());

    assert!(controller.shutdown(Duration::from_secs(1)).await.success);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_fire_with_empty_provider() {
    let scope = TestScope::new();
    let controller = ControllerBuilder::new().build(&scope);
    controller.start().unwrap();

    let iterations = TestHelpers::heartbeats(&scope, 3).await;

    assert_eq!(iterations, vec![1, 2, 3]);
    assert!(scope.bus.drain_all().get(INSTANCE_READY).is_none());
    controller.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_actions_until_resume() {
    let scope = TestScope::new();
    let controller = ControllerBuilder::new()
        .with_batch(vec![TestFixtures::running(TestFixtures::INSTANCE_2)])
        .build(&scope);

    // The loop task has not run yet, so its first tick already sees Paused
    controller.start().unwrap();
    controller.pause().unwrap();
    assert_eq!(controller.state(), MonitorState::Paused);

    // Heartbeats continue while paused, but no readiness events appear
    let iterations = TestHelpers::heartbeats(&scope, 3).await;
    assert!(iterations.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(
        scope
            .try_expect(INSTANCE_READY, None, Duration::from_millis(300))
            .await
            .is_err()
    );

    controller.resume().unwrap();
    scope.expect(INSTANCE_READY, Some(TestFixtures::INSTANCE_2)).await;
    assert_eq!(controller.state(), MonitorState::Running);

    controller.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_container_failure_is_isolated_to_one_action() {
    let scope = TestScope::new();
    let controller = ControllerBuilder::new()
        .with_batch(vec![
            TestFixtures::running(TestFixtures::INSTANCE_1),
            TestFixtures::running(TestFixtures::INSTANCE_2),
        ])
        .with_containers(|containers| {
            containers
                .expect_create_instance_container()
                .returning(|instance_id, port| {
                    if instance_id == TestFixtures::INSTANCE_1 {
                        Err(anyhow::anyhow!("docker daemon unavailable"))
                    } else {
                        Ok(TestFixtures::container(instance_id, port))
                    }
                });
            containers
                .expect_remove_instance_container()
                .returning(|_| Ok(()));
        })
        .build(&scope);
    controller.start().unwrap();

    let error = scope.expect(MONITOR_ERROR, Some(TestFixtures::INSTANCE_1)).await;
    assert!(error.get("error").unwrap().as_str().unwrap().contains("docker daemon unavailable"));
    scope.expect(HTTP_READY, Some(TestFixtures::INSTANCE_2)).await;

    assert!(scope.diagnostics.has_status("provision-error"));
    let statistics = controller.statistics();
    assert_eq!(statistics.instances_detected, 1);
    assert_eq!(statistics.provisioning_failures, 1);

    controller.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_http_hook_runs_before_http_ready() {
    let scope = TestScope::new();
    let controller = ControllerBuilder::new()
        .with_batch(vec![TestFixtures::running(TestFixtures::INSTANCE_1)])
        .with_hook(|hook| {
            hook.expect_on_ssh_ready()
                .withf(|instance_id, metadata| {
                    instance_id == TestFixtures::INSTANCE_1 && metadata.contains_key("port")
                })
                .times(1)
                .returning(|_, _| Ok(()));
        })
        .build(&scope);
    controller.start().unwrap();

    scope.expect(HTTP_READY, Some(TestFixtures::INSTANCE_1)).await;
    controller.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_hook_suppresses_http_ready() {
    let scope = TestScope::new();
    let controller = ControllerBuilder::new()
        .with_batch(vec![TestFixtures::running(TestFixtures::INSTANCE_1)])
        .with_hook(|hook| {
            hook.expect_on_ssh_ready()
                .returning(|_, _| Err(anyhow::anyhow!("http server failed to bind")));
        })
        .build(&scope);
    controller.start().unwrap();

    scope.expect(SSH_READY, Some(TestFixtures::INSTANCE_1)).await;
    scope.expect(MONITOR_ERROR, Some(TestFixtures::INSTANCE_1)).await;
    TestHelpers::heartbeats(&scope, 2).await;

    assert!(scope.bus.try_take(HTTP_READY, None).is_none());
    assert!(scope.diagnostics.has_status("http-start-error"));
    controller.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_publishes_terminal_event_and_stops_heartbeats() {
    let scope = TestScope::new();
    let controller = ControllerBuilder::new().build(&scope);
    controller.start().unwrap();
    TestHelpers::heartbeats(&scope, 2).await;

    let result = controller.shutdown(Duration::from_secs(1)).await;

    assert!(result.success);
    assert_eq!(result.error, None);
    let shutdown = scope.expect(MONITOR_SHUTDOWN, None).await;
    assert_eq!(shutdown.get("success"), Some(&json!(true)));

    TestHelpers::discard(&scope, MONITOR_HEARTBEAT);
    assert!(
        scope
            .try_expect(MONITOR_HEARTBEAT, None, Duration::from_secs(2))
            .await
            .is_err()
    );
    assert!(controller.pause().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_registry_cleanup_unwinds_controller_resources() {
    let scope = TestScope::new();
    let controller = ControllerBuilder::new()
        .with_batch(vec![
            TestFixtures::running(TestFixtures::INSTANCE_1),
            TestFixtures::running(TestFixtures::INSTANCE_2),
        ])
        .build(&scope);
    controller.start().unwrap();
    scope.expect(HTTP_READY, Some(TestFixtures::INSTANCE_2)).await;

    let report = scope.registry.cleanup_all().await;

    let kinds: Vec<&str> = report.disposed.iter().map(|(kind, _)| kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["ssh-container", "ssh-port", "ssh-container", "ssh-port", "monitor"]
    );
    assert_eq!(controller.state(), MonitorState::Stopped);
    assert!(scope.registry.cleanup_all().await.disposed.is_empty());
}
