//! End-to-end readiness scenario over simulated collaborators
//!
//! Drives a monitor controller through provisioning a set of instances,
//! opens one sync session per instance, exercises pause/resume and then
//! unwinds everything through the resource registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use shared::{component_info, event_types, payload};

use super::scope::{ScenarioScope, TeardownReport};
use super::simulated::{
    InMemoryContainerManager, RecordingCloudClient, ScriptedActionProvider, SignalingHttpHook, SimulatedCommandRunner,
    http_started_signal,
};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::monitor::{MonitorAction, MonitorController};
use crate::mutagen::{CliSessionTerminator, MutagenSessionManager};
use crate::services::ports::SshPortPool;

const COMPONENT: &str = "scenario";

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceReadiness {
    pub instance_id: String,
    pub port: u16,
    pub container_id: String,
    pub session_id: String,
}

#[derive(Debug)]
pub struct ScenarioReport {
    pub instances: Vec<InstanceReadiness>,
    pub heartbeats: u64,
    pub elapsed: Duration,
    pub teardown: TeardownReport,
}

/// Run the readiness pipeline for `instance_ids`.
///
/// Teardown runs whether or not the scenario succeeds.
pub async fn run_readiness_scenario(config: &HarnessConfig, instance_ids: &[String]) -> HarnessResult<ScenarioReport> {
    let started = Instant::now();
    let scope = ScenarioScope::new(config);

    let outcome = scope
        .timeouts
        .run("readiness-scenario", config.scenario_budget, drive(&scope, config, instance_ids))
        .await;
    let teardown = scope.teardown().await;

    let (instances, heartbeats) = outcome??;
    if !teardown.cleanup.is_clean() {
        return Err(HarnessError::ScenarioFailed {
            reason: format!("{} cleanup failures", teardown.cleanup.failures.len()),
        });
    }

    Ok(ScenarioReport {
        instances,
        heartbeats,
        elapsed: started.elapsed(),
        teardown,
    })
}

async fn drive(
    scope: &ScenarioScope,
    config: &HarnessConfig,
    instance_ids: &[String],
) -> HarnessResult<(Vec<InstanceReadiness>, u64)> {
    let batch = instance_ids
        .iter()
        .map(|id| MonitorAction::new(id.clone(), "running").with_metadata(payload([("image_id", json!("ami-sim"))])))
        .collect();

    let controller = MonitorController::builder(scope.event_bus.clone(), scope.registry.clone(), scope.timeouts.clone())
        .action_provider(Arc::new(ScriptedActionProvider::new(vec![batch])))
        .container_manager(Arc::new(InMemoryContainerManager::new()))
        .cloud_client(Arc::new(RecordingCloudClient::default()))
        .http_ready_hook(Arc::new(SignalingHttpHook::new(scope.signals.clone())))
        .port_pool(Arc::new(SshPortPool::new(config.ssh_port_range())))
        .diagnostics(scope.diagnostics.clone())
        .settings(config.monitor_settings())
        .build()?;
    controller.start()?;

    let runner = Arc::new(SimulatedCommandRunner::succeeding());
    let sessions = MutagenSessionManager::builder(
        scope.event_bus.clone(),
        scope.registry.clone(),
        scope.timeouts.clone(),
        runner.clone(),
    )
    .terminator(Arc::new(CliSessionTerminator::new(runner)))
    .diagnostics(scope.diagnostics.clone())
    .build();

    let mut instances = Vec::with_capacity(instance_ids.len());
    for instance_id in instance_ids {
        let readiness = await_instance(scope, config, instance_id).await?;

        let arguments = vec![
            "sync".to_string(),
            "create".to_string(),
            format!("--name={}", readiness.session_id),
            format!("localhost:{}", readiness.port),
        ];
        sessions
            .create_session(
                &readiness.session_id,
                instance_id,
                &arguments,
                config.session_timeout,
                payload([("port", json!(readiness.port))]),
            )
            .await?;
        scope
            .event_bus
            .wait_for(event_types::MUTAGEN_STATUS, Some(&readiness.session_id), config.wait_timeout)
            .await?;

        instances.push(readiness);
    }
    scope.timeouts.checkpoint("instances ready");

    // Heartbeats keep flowing while paused
    controller.pause()?;
    while scope.event_bus.try_take(event_types::MONITOR_HEARTBEAT, None).is_some() {}
    scope
        .event_bus
        .wait_for(event_types::MONITOR_HEARTBEAT, None, config.wait_timeout)
        .await?;
    controller.resume()?;

    let shutdown = controller.shutdown(config.shutdown_timeout).await;
    if !shutdown.success {
        return Err(HarnessError::ScenarioFailed {
            reason: shutdown.error.unwrap_or_else(|| "monitor did not stop".to_string()),
        });
    }

    Ok((instances, controller.statistics().poll_iterations))
}

async fn await_instance(
    scope: &ScenarioScope,
    config: &HarnessConfig,
    instance_id: &str,
) -> HarnessResult<InstanceReadiness> {
    let budget = scope
        .timeouts
        .sub_budget(&format!("readiness-{instance_id}"), config.wait_timeout)?;
    let bus = &scope.event_bus;

    bus.wait_for(event_types::INSTANCE_READY, Some(instance_id), budget.remaining())
        .await?;
    let ssh = bus
        .wait_for(event_types::SSH_READY, Some(instance_id), budget.remaining())
        .await?;
    let http = bus
        .wait_for(event_types::HTTP_READY, Some(instance_id), budget.remaining())
        .await?;
    scope
        .signals
        .wait_for(&http_started_signal(instance_id), budget.remaining())
        .await?;

    let port = ssh
        .get("port")
        .and_then(|value| value.as_u64())
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| HarnessError::ScenarioFailed {
            reason: format!("ssh-ready for {instance_id} carried no port"),
        })?;
    let container_id = http
        .get("container_id")
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_string();

    component_info!(COMPONENT, instance_id, port, container_id = %container_id, "Instance ready");

    Ok(InstanceReadiness {
        instance_id: instance_id.to_string(),
        port,
        container_id,
        session_id: format!("sync-{instance_id}"),
    })
}
