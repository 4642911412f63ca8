//! Actor implementations

pub mod worker;

pub use worker::{HostHandle, HostWorker, HostWorkerArgs};
