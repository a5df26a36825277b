//! Error types for sigward.

use thiserror::Error;

/// Failure that terminates the daemon
#[derive(Error, Debug)]
pub enum SigwardError {
    /// Event subscription lost for good
    #[error("Event transport error: {0}")]
    Transport(String),

    /// Engine unusable at startup
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SigwardError {
    /// Process exit code used when this error terminates the daemon
    pub fn exit_code(&self) -> i32 {
        match self {
            SigwardError::Config(_) => 78,
            SigwardError::Engine(_) => 69,
            SigwardError::Transport(_) => 75,
        }
    }
}
