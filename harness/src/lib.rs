//! Concurrency-coordination core for simulated infrastructure scenarios
//!
//! Leaf services (event bus, timeout budgets, resource registry, signal
//! registry) are composed by the monitor controller and the sync session
//! manager. Collaborators such as cloud clients and container managers sit
//! behind the traits in [`traits`] so scenarios can run against real or
//! simulated implementations.

pub mod config;
pub mod error;
pub mod monitor;
pub mod mutagen;
pub mod scenarios;
pub mod services;
pub mod traits;

// Re-export commonly used types
pub use config::{HarnessConfig, HarnessConfigBuilder};
pub use error::{HarnessError, HarnessResult};
pub use monitor::{MonitorAction, MonitorController, MonitorSettings, MonitorShutdownResult, MonitorState};
pub use mutagen::{MutagenSession, MutagenSessionManager, SessionStatus, TerminationSummary};
pub use scenarios::ScenarioScope;
pub use services::{
    DiagnosticsCollector, EventBus, ResourceRegistry, SignalRegistry, SshPortPool, TimeoutManager,
};
pub use traits::*;
