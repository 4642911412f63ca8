//! Error types for muxrun-exec

use std::time::Duration;

use thiserror::Error;

use crate::result::CommandResult;

/// Errors that can occur while talking to a session or coordinator
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to start the session shell
    #[error("failed to spawn session shell: {0}")]
    SpawnError(String),

    /// The coordinator did not announce itself
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A read did not complete in time
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// The remote side sent something the protocol does not allow
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The session ended before the batch completed
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// I/O error on the session pipes
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,

    /// The batch could not be encoded
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::IoError(err.to_string())
    }
}

/// A batch that failed part way through
///
/// Carries whatever results were collected before the failure. Slots that
/// never received a result hold a `Timeout` or `Error` value.
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct BatchFailure {
    /// What went wrong
    pub error: ExecError,
    /// One entry per command in the batch
    pub results: Vec<CommandResult>,
}

impl BatchFailure {
    /// Failure before any command reached the remote side
    #[must_use]
    pub fn rejected(error: ExecError, batch_size: usize) -> Self {
        let results = vec![CommandResult::error(error.to_string()); batch_size];
        Self { error, results }
    }
}
