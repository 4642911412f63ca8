//! Starting the coordinator inside a remote shell
//!
//! By default nothing has to be installed on the target: the coordinator
//! source ships inside this crate and is handed to an interpreter that is
//! already on the host, compressed and base64 encoded into a single line.
//! An installed coordinator (such as `muxrun coordinator`) can be used
//! instead through [`CoordinatorLaunch::Installed`].

use std::io::{self, Write};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::ZlibEncoder;

use crate::batch::Mode;
use crate::error::ExecError;

/// Coordinator program sent to hosts that have nothing installed
pub const COORDINATOR_SOURCE: &str = include_str!("coordinator.py");

/// Interpreter used for the embedded coordinator unless configured
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Printed by the shell when the coordinator command itself fails
///
/// Followed by the exit status of the failed command.
pub const LAUNCH_FAILED: &str = "muxrun-launch-failed";

/// How the coordinator gets started on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorLaunch {
    /// Feed the bundled source to `interpreter`
    Embedded { interpreter: String },
    /// Run a coordinator that already exists on the host
    Installed(Vec<String>),
}

impl Default for CoordinatorLaunch {
    fn default() -> Self {
        Self::Embedded {
            interpreter: DEFAULT_INTERPRETER.to_string(),
        }
    }
}

impl CoordinatorLaunch {
    /// Embedded coordinator run by `interpreter`
    pub fn embedded(interpreter: impl Into<String>) -> Self {
        Self::Embedded {
            interpreter: interpreter.into(),
        }
    }

    /// Installed coordinator started with `argv`
    pub fn installed<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Installed(argv.into_iter().map(Into::into).collect())
    }
}

/// One-line interpreter program that inflates and runs the coordinator
///
/// # Errors
/// Returns `ExecError::ConfigError` if compression fails
pub fn loader() -> Result<String, ExecError> {
    let compressed = compress(COORDINATOR_SOURCE)
        .map_err(|e| ExecError::ConfigError(format!("failed to pack coordinator: {e}")))?;
    Ok(format!(
        "import base64,zlib;exec(zlib.decompress(base64.b64decode('{}')))",
        STANDARD.encode(compressed)
    ))
}

fn compress(source: &str) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(source.as_bytes())?;
    encoder.finish()
}

/// Build the shell line that starts the coordinator in `mode`
///
/// `None` for `max_runtime` disables the coordinator's own deadline. If the
/// coordinator cannot be started the shell prints [`LAUNCH_FAILED`] and the
/// exit status instead of the ready line.
///
/// # Errors
/// Returns `ExecError::ConfigError` if the command is empty or cannot be quoted
pub fn bootstrap_line(
    launch: &CoordinatorLaunch,
    mode: Mode,
    max_runtime: Option<Duration>,
) -> Result<String, ExecError> {
    let mut words = match launch {
        CoordinatorLaunch::Embedded { interpreter } => {
            vec![interpreter.clone(), "-c".to_string(), loader()?]
        }
        CoordinatorLaunch::Installed(argv) => argv.clone(),
    };
    if words.first().is_none_or(|program| program.trim().is_empty()) {
        return Err(ExecError::ConfigError(
            "coordinator command is empty".to_string(),
        ));
    }

    let max_runtime = max_runtime.map_or(0, |d| d.as_secs().max(1));
    words.extend([
        "--mode".to_string(),
        mode.as_str().to_string(),
        "--max-runtime".to_string(),
        max_runtime.to_string(),
    ]);

    let command = shlex::try_join(words.iter().map(String::as_str))
        .map_err(|e| ExecError::ConfigError(e.to_string()))?;
    Ok(format!("{command} || echo \"{LAUNCH_FAILED} $?\""))
}
