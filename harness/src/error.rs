//! Harness-level error types

use shared::SharedError;
use thiserror::Error;

use crate::monitor::MonitorError;
use crate::mutagen::MutagenError;
use crate::services::event_bus::EventBusError;
use crate::services::ports::PortError;
use crate::services::registry::RegistryError;
use crate::services::signals::SignalError;
use crate::services::timeout::BudgetError;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Mutagen(#[from] MutagenError),

    #[error("Shared component error: {0}")]
    Shared(#[from] SharedError),

    #[error("Scenario failed: {reason}")]
    ScenarioFailed { reason: String },

    #[error("Configuration error: {field}: {message}")]
    ConfigurationError { field: String, message: String },
}

impl HarnessError {
    /// Whether this error is a deadline expiring rather than an operational failure
    pub fn is_timeout(&self) -> bool {
        match self {
            HarnessError::EventBus(EventBusError::Timeout { .. }) => true,
            HarnessError::Signal(SignalError::Timeout { .. }) => true,
            HarnessError::Budget(_) => true,
            HarnessError::Mutagen(MutagenError::Timeout { .. }) => true,
            _ => false,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
