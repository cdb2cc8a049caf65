//! In-process collaborators used by the scenario binary and tests
//!
//! None of these touch real infrastructure. They record what they were
//! asked to do so scenarios can assert on it afterwards.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use shared::Payload;
use tracing::debug;

use crate::monitor::MonitorAction;
use crate::services::signals::SignalRegistry;
use crate::traits::{
    ActionProvider, CloudClient, CommandResult, CommandRunner, ContainerManager, HttpReadyHook, InstanceContainer,
    RunnerError,
};

/// Signal published by [`SignalingHttpHook`] once an instance's HTTP side is up
pub fn http_started_signal(instance_id: &str) -> String {
    format!("http-started:{instance_id}")
}

/// Returns one scripted batch per poll, then empty batches
#[derive(Default)]
pub struct ScriptedActionProvider {
    batches: Mutex<VecDeque<Vec<MonitorAction>>>,
}

impl ScriptedActionProvider {
    pub fn new(batches: Vec<Vec<MonitorAction>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }

    pub fn push_batch(&self, batch: Vec<MonitorAction>) {
        self.batches.lock().push_back(batch);
    }
}

#[async_trait]
impl ActionProvider for ScriptedActionProvider {
    async fn poll(&self) -> anyhow::Result<Vec<MonitorAction>> {
        Ok(self.batches.lock().pop_front().unwrap_or_default())
    }
}

/// Tracks containers in memory instead of starting them
#[derive(Default)]
pub struct InMemoryContainerManager {
    next_id: AtomicU64,
    containers: Mutex<HashMap<String, InstanceContainer>>,
}

impl InMemoryContainerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Containers created and not yet removed
    pub fn active(&self) -> Vec<InstanceContainer> {
        self.containers.lock().values().cloned().collect()
    }
}

#[async_trait]
impl ContainerManager for InMemoryContainerManager {
    async fn create_instance_container(&self, instance_id: &str, host_port: u16) -> anyhow::Result<InstanceContainer> {
        let sequence = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let container = InstanceContainer {
            container_id: format!("ssh-{sequence:04}"),
            instance_id: instance_id.to_string(),
            port: host_port,
            key_file: std::env::temp_dir().join(format!("{instance_id}.pem")),
        };

        let mut containers = self.containers.lock();
        if containers.values().any(|existing| existing.port == host_port) {
            anyhow::bail!("port {host_port} already bound by another container");
        }
        containers.insert(container.container_id.clone(), container.clone());
        debug!(container_id = %container.container_id, instance_id, port = host_port, "Created simulated container");
        Ok(container)
    }

    async fn remove_instance_container(&self, container: InstanceContainer) -> anyhow::Result<()> {
        match self.containers.lock().remove(&container.container_id) {
            Some(_) => Ok(()),
            None => anyhow::bail!("unknown container {}", container.container_id),
        }
    }
}

/// Records tag requests
#[derive(Default)]
pub struct RecordingCloudClient {
    tags: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl RecordingCloudClient {
    pub fn tags_for(&self, resource: &str) -> Option<BTreeMap<String, String>> {
        self.tags.lock().get(resource).cloned()
    }
}

#[async_trait]
impl CloudClient for RecordingCloudClient {
    async fn create_tags(&self, resources: &[String], tags: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let mut recorded = self.tags.lock();
        for resource in resources {
            recorded
                .entry(resource.clone())
                .or_default()
                .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }
}

/// Publishes a per-instance signal when HTTP readiness is reached
pub struct SignalingHttpHook {
    signals: Arc<SignalRegistry>,
}

impl SignalingHttpHook {
    pub fn new(signals: Arc<SignalRegistry>) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl HttpReadyHook for SignalingHttpHook {
    async fn on_ssh_ready(&self, instance_id: &str, metadata: &Payload) -> anyhow::Result<()> {
        let port = metadata.get("port").cloned().unwrap_or(json!(null));
        self.signals.publish(
            &http_started_signal(instance_id),
            Some(json!({ "instance_id": instance_id, "port": port })),
        );
        Ok(())
    }
}

/// Answers every command with a fixed result after an optional delay
pub struct SimulatedCommandRunner {
    exit_code: i32,
    delay: Duration,
    invocations: Mutex<Vec<Vec<String>>>,
}

impl SimulatedCommandRunner {
    pub fn succeeding() -> Self {
        Self::with_exit_code(0)
    }

    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for SimulatedCommandRunner {
    async fn run(&self, arguments: &[String], timeout: Duration) -> Result<CommandResult, RunnerError> {
        self.invocations.lock().push(arguments.to_vec());
        if self.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(RunnerError::TimedOut(timeout));
        }
        tokio::time::sleep(self.delay).await;

        let stderr = if self.exit_code == 0 {
            String::new()
        } else {
            format!("simulated failure running {}", arguments.join(" "))
        };
        Ok(CommandResult {
            exit_code: self.exit_code,
            stdout: String::new(),
            stderr,
        })
    }
}
