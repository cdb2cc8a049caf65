//! Pausable polling state machine
//!
//! A [`MonitorController`] polls an action provider on a fixed interval and
//! turns each newly ready instance into the event chain
//! `instance-ready` → `ssh-ready` → `http-ready`.

pub mod controller;
pub mod types;


use thiserror::Error;

pub use controller::{MonitorController, MonitorControllerBuilder};
pub use types::{MonitorAction, MonitorSettings, MonitorShutdownResult, MonitorState, MonitorStatistics};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("Cannot {action} a monitor that is {from}")]
    InvalidTransition { from: MonitorState, action: &'static str },

    #[error("Monitor has been shut down and cannot be restarted")]
    AlreadyShutDown,

    #[error("Monitor requires a {0}")]
    MissingCollaborator(&'static str),
}
