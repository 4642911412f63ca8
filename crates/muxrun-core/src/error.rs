//! Core error types for muxrun-core

use thiserror::Error;

use muxrun_exec::ExecError;

/// Errors that can occur in dispatcher and worker operations
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Batch construction or session error
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// No worker is tracked for the host
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),
}
