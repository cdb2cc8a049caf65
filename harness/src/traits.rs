//! Collaborator trait definitions with mockall annotations for testing
//!
//! The coordination core never talks to cloud APIs, containers or sync
//! processes directly. Each boundary is a trait here so scenarios can plug in
//! real or simulated implementations and tests can use the generated mocks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use shared::Payload;
use thiserror::Error;

use crate::monitor::MonitorAction;

/// A simulated SSH-accessible container bound to a host port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceContainer {
    pub container_id: String,
    pub instance_id: String,
    pub port: u16,
    pub key_file: PathBuf,
}

/// Output of a finished external command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Failed to launch command: {0}")]
    Launch(#[from] std::io::Error),
}

/// Source of instance state reports polled by the monitor loop
#[mockall::automock]
#[async_trait::async_trait]
pub trait ActionProvider: Send + Sync {
    /// Return the actions observed since the previous poll
    async fn poll(&self) -> anyhow::Result<Vec<MonitorAction>>;
}

/// Materializes SSH-accessible containers for ready instances
#[mockall::automock]
#[async_trait::async_trait]
pub trait ContainerManager: Send + Sync {
    async fn create_instance_container(&self, instance_id: &str, host_port: u16) -> anyhow::Result<InstanceContainer>;

    /// Used as the registered disposer for a container
    async fn remove_instance_container(&self, container: InstanceContainer) -> anyhow::Result<()>;
}

/// Cloud API used to tag provisioned compute resources
#[mockall::automock]
#[async_trait::async_trait]
pub trait CloudClient: Send + Sync {
    async fn create_tags(&self, resources: &[String], tags: &BTreeMap<String, String>) -> anyhow::Result<()>;
}

/// Hook run after SSH readiness and before `http-ready` is published
#[mockall::automock]
#[async_trait::async_trait]
pub trait HttpReadyHook: Send + Sync {
    async fn on_ssh_ready(&self, instance_id: &str, metadata: &Payload) -> anyhow::Result<()>;
}

/// Executes external commands with a hard timeout
#[mockall::automock]
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, arguments: &[String], timeout: Duration) -> Result<CommandResult, RunnerError>;
}

/// Tears down a single external sync session
#[mockall::automock]
#[async_trait::async_trait]
pub trait SessionTerminator: Send + Sync {
    async fn terminate(&self, session_id: &str) -> anyhow::Result<()>;
}

/// Fire-and-forget structured diagnostics.
///
/// Implementations must swallow their own failures.
#[mockall::automock]
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, category: &str, status: &str, details: Payload);
}
