//! muxrun-core: Host workers and the dispatcher
//!
//! Implements the per-host `HostWorker` actor using kameo and the
//! `Dispatcher` registry callers submit batches through.

pub mod actor;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod state;

pub use actor::{HostHandle, HostWorker, HostWorkerArgs};
pub use config::{CoordinatorConfig, DispatcherConfig, TransportConfig, WorkerConfig};
pub use dispatcher::{Dispatcher, HOST_TIMEOUT_MESSAGE};
pub use error::CoreError;
pub use message::{HostEvent, IdleProbe, Probe, RunBatch};
pub use state::{HostStatus, Liveness, LivenessState};
