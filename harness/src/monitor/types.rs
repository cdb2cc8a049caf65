//! Data types exchanged with the monitor loop

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::Payload;

/// Instance state report produced by an action provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAction {
    pub instance_id: String,
    pub state: String,
    #[serde(default)]
    pub metadata: Payload,
}

impl MonitorAction {
    pub fn new(instance_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            state: state.into(),
            metadata: Payload::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Lifecycle of a controller. `Stopped` is both the initial and terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Stopped => "stopped",
            MonitorState::Running => "running",
            MonitorState::Paused => "paused",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStatistics {
    pub instances_detected: u64,
    pub provisioning_failures: u64,
    pub poll_iterations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorShutdownResult {
    pub success: bool,
    pub error: Option<String>,
}

impl MonitorShutdownResult {
    pub fn stopped() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Tuning knobs for a controller's poll loop
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Upper bound on one tick's action processing
    pub watchdog_budget: Duration,
    /// Action states that trigger provisioning
    pub ready_states: Vec<String>,
    /// Used when the registry drives shutdown
    pub shutdown_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            watchdog_budget: Duration::from_secs(10),
            ready_states: vec!["running".to_string()],
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl MonitorSettings {
    pub fn is_ready_state(&self, state: &str) -> bool {
        self.ready_states.iter().any(|ready| ready == state)
    }
}
