//! Process-backed command runner and session terminator

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::traits::{CommandResult, CommandRunner, RunnerError, SessionTerminator};

const DEFAULT_PROGRAM: &str = "mutagen";
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a CLI program as a child process, killing it when the timeout expires
#[derive(Debug, Clone)]
pub struct ProcessCommandRunner {
    program: String,
}

impl ProcessCommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for ProcessCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, arguments: &[String], timeout: Duration) -> Result<CommandResult, RunnerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, ?arguments, timeout_ms = timeout.as_millis() as u64, "Running command");

        // Dropping the output future on timeout kills the child
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| RunnerError::TimedOut(timeout))??;

        Ok(CommandResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Terminates sessions with `<program> sync terminate <session_id>`
pub struct CliSessionTerminator {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl CliSessionTerminator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: TERMINATE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SessionTerminator for CliSessionTerminator {
    async fn terminate(&self, session_id: &str) -> anyhow::Result<()> {
        let arguments = vec!["sync".to_string(), "terminate".to_string(), session_id.to_string()];
        let result = self.runner.run(&arguments, self.timeout).await?;
        if !result.success() {
            anyhow::bail!(
                "terminate exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            );
        }
        Ok(())
    }
}
