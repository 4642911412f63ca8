//! muxrun-exec: Session and coordinator plumbing
//!
//! Provides the persistent per-host session, the line protocol it speaks, and
//! the coordinator program that runs many commands over one session. The
//! coordinator is embedded and sent through the shell, so target hosts only
//! need an interpreter.

pub mod batch;
pub mod bootstrap;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod result;
pub mod session;
pub mod transport;

pub use batch::{Batch, Command, Mode};
pub use bootstrap::CoordinatorLaunch;
pub use coordinator::Coordinator;
pub use error::{BatchFailure, ExecError};
pub use result::{CommandOutput, CommandResult};
pub use session::{Session, SessionOptions};
pub use transport::{LocalShell, RemoteShell, Transport, Transports};
