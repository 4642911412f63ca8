//! Message types for actor communication
//!
//! Message handlers are implemented in their respective actor modules.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use muxrun_exec::{Batch, CommandResult};

use crate::state::Liveness;

// ============================================================================
// HostWorker Messages
// ============================================================================

/// Run a batch and deliver one result per command on `reply`
#[derive(Debug)]
pub struct RunBatch {
    /// Commands to run, carrying their shell mode
    pub batch: Batch,
    /// Per-call response channel
    pub reply: oneshot::Sender<Vec<CommandResult>>,
}

/// Sent periodically; re-probes the host if the worker has been idle
#[derive(Debug)]
pub struct IdleProbe;

/// Probe now, replying with the resulting liveness
#[derive(Debug)]
pub struct Probe;

// ============================================================================
// Host events
// ============================================================================

/// Lifecycle and liveness events broadcast by workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostEvent {
    WorkerStarted {
        host: String,
    },
    LivenessChanged {
        host: String,
        from: Liveness,
        to: Liveness,
    },
    WorkerStopped {
        host: String,
        reason: String,
    },
}
