//! External sync session management

pub mod manager;
pub mod runner;


use thiserror::Error;

use crate::traits::RunnerError;

pub use manager::{
    MutagenSession, MutagenSessionManager, MutagenSessionManagerBuilder, SessionStatus, TerminationSummary,
};
pub use runner::{CliSessionTerminator, ProcessCommandRunner};

#[derive(Error, Debug)]
pub enum MutagenError {
    #[error("Sync session '{session_id}' timed out: {message}")]
    Timeout { session_id: String, message: String },

    #[error("Sync session '{session_id}' failed with exit code {exit_code}: {stderr}")]
    Session {
        session_id: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Sync session '{session_id}' could not run: {source}")]
    Runner {
        session_id: String,
        #[source]
        source: RunnerError,
    },

    #[error("Failed to terminate sync session '{session_id}': {message}")]
    Terminate { session_id: String, message: String },
}

impl MutagenError {
    pub fn session_id(&self) -> &str {
        match self {
            MutagenError::Timeout { session_id, .. }
            | MutagenError::Session { session_id, .. }
            | MutagenError::Runner { session_id, .. }
            | MutagenError::Terminate { session_id, .. } => session_id,
        }
    }
}
