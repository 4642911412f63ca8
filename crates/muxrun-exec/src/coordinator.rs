//! Coordinator program run inside the remote shell
//!
//! Reads a batch of commands, starts them all, and reports one result per
//! command once both of its output streams have closed and the process has
//! been reaped. All pipes are driven by a single-threaded runtime, so one
//! readiness reactor covers every open descriptor.
//!
//! This is the installed form (`muxrun coordinator`). Sessions use the
//! bundled interpreter version from [`crate::bootstrap`] unless configured
//! otherwise; both speak the same protocol.

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::batch::{Command, Mode};
use crate::error::ExecError;
use crate::protocol::{self, DONE, READY_LINE};
use crate::result::CommandOutput;

/// Default wall-clock bound for one coordinator run
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(120);

/// Status reported for commands killed at the max runtime
pub const MAX_RUNTIME_STATUS: i32 = 124;

/// Stderr reported for commands killed at the max runtime
pub const MAX_RUNTIME_MESSAGE: &str = "max runtime exceeded";

const READ_CHUNK: usize = 4096;

/// One coordinator run: a single batch in a single mode
#[derive(Debug, Clone)]
pub struct Coordinator {
    mode: Mode,
    max_runtime: Option<Duration>,
}

impl Coordinator {
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            max_runtime: Some(DEFAULT_MAX_RUNTIME),
        }
    }

    /// Bound the whole run; `None` lets commands run forever
    #[must_use]
    pub fn with_max_runtime(mut self, max_runtime: Option<Duration>) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    /// Serve one batch on the process's stdin/stdout
    ///
    /// Input is read synchronously and never past the sentinel, so the
    /// surrounding shell keeps every byte that follows it.
    ///
    /// # Errors
    /// Returns an I/O error if stdin or stdout is gone
    pub fn serve_stdio(&self) -> Result<(), ExecError> {
        let mut stdout = io::stdout();
        self.announce(&mut stdout)?;

        let commands = self.read_commands(io::stdin().lock())?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let mut out = tokio::io::stdout();
            self.run(commands, &mut out).await
        })
    }

    /// Write the handshake line
    ///
    /// # Errors
    /// Returns an I/O error if the line cannot be written
    pub fn announce<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{READY_LINE}")?;
        out.flush()
    }

    /// Read command lines up to the sentinel
    ///
    /// A line that does not decode is kept as an error so the command still
    /// gets a result at its index. EOF ends the input like the sentinel does.
    ///
    /// # Errors
    /// Returns an I/O error if reading fails
    pub fn read_commands<R: BufRead>(&self, input: R) -> io::Result<Vec<Result<Command, String>>> {
        let mut commands = Vec::new();
        for line in input.lines() {
            let line = line?;
            if line == DONE {
                break;
            }
            commands.push(protocol::decode_command(&line, self.mode));
        }
        debug!(count = commands.len(), mode = %self.mode, "read commands");
        Ok(commands)
    }

    /// Start every command and stream results to `out`, then the sentinel
    ///
    /// When the max runtime expires the commands still running are killed and
    /// reported with [`MAX_RUNTIME_STATUS`] before the sentinel, so every
    /// index gets exactly one result.
    ///
    /// # Errors
    /// Returns an I/O error if `out` cannot be written
    pub async fn run<W>(
        &self,
        commands: Vec<Result<Command, String>>,
        out: &mut W,
    ) -> Result<(), ExecError>
    where
        W: AsyncWrite + Unpin,
    {
        let deadline = self.max_runtime.map(|limit| Instant::now() + limit);
        let mut running = JoinSet::new();
        let mut unfinished = BTreeSet::new();

        for (index, command) in commands.into_iter().enumerate() {
            match command.and_then(|c| spawn(&c).map_err(|e| e.to_string())) {
                Ok(child) => {
                    running.spawn(async move { (index, drain(child).await) });
                    unfinished.insert(index);
                }
                Err(message) => {
                    debug!(index, error = %message, "command failed to start");
                    emit(out, index, &CommandOutput::start_failure(message)).await?;
                }
            }
        }

        let mut expired = false;
        loop {
            let joined = match deadline {
                Some(deadline) => match timeout_at(deadline, running.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        expired = true;
                        break;
                    }
                },
                None => running.join_next().await,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((index, Ok(output))) => {
                    unfinished.remove(&index);
                    emit(out, index, &output).await?;
                }
                Ok((index, Err(e))) => {
                    unfinished.remove(&index);
                    emit(out, index, &CommandOutput::start_failure(e.to_string())).await?;
                }
                Err(e) => warn!(error = %e, "command task failed"),
            }
        }

        if !unfinished.is_empty() {
            // children are killed as their tasks drop
            running.shutdown().await;
            if expired {
                warn!(
                    count = unfinished.len(),
                    max_runtime = ?self.max_runtime,
                    "max runtime exceeded"
                );
            }
            for index in unfinished {
                let output = if expired {
                    CommandOutput::new(MAX_RUNTIME_STATUS, "", MAX_RUNTIME_MESSAGE)
                } else {
                    CommandOutput::start_failure("command task failed")
                };
                emit(out, index, &output).await?;
            }
        }

        out.write_all(DONE.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

fn spawn(command: &Command) -> io::Result<Child> {
    let mut cmd = match command {
        Command::Argv(argv) => {
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;
            let mut cmd = tokio::process::Command::new(program);
            cmd.args(args);
            cmd
        }
        Command::Shell(script) => {
            let mut cmd = tokio::process::Command::new("/bin/sh");
            cmd.arg("-c").arg(script);
            cmd
        }
    };

    // Children must never read the session's stdin
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Read both pipes until they close, then reap the process
async fn drain(mut child: Child) -> io::Result<CommandOutput> {
    let missing = || io::Error::other("child pipe was not captured");
    let mut out_pipe = child.stdout.take().ok_or_else(missing)?;
    let mut err_pipe = child.stderr.take().ok_or_else(missing)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];
    let mut out_open = true;
    let mut err_open = true;
    let mut waiting = 2;

    while waiting > 0 {
        tokio::select! {
            read = out_pipe.read(&mut out_buf), if out_open => {
                if !collect(read?, &out_buf, &mut stdout) {
                    out_open = false;
                    waiting -= 1;
                }
            }
            read = err_pipe.read(&mut err_buf), if err_open => {
                if !collect(read?, &err_buf, &mut stderr) {
                    err_open = false;
                    waiting -= 1;
                }
            }
        }
    }

    let status = child.wait().await?;
    Ok(CommandOutput {
        status: exit_code(status),
        stdout,
        stderr,
    })
}

/// Append a chunk; `false` means the stream reached EOF
fn collect(n: usize, buf: &[u8], into: &mut Vec<u8>) -> bool {
    if n == 0 {
        return false;
    }
    into.extend_from_slice(&buf[..n]);
    true
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

async fn emit<W>(out: &mut W, index: usize, output: &CommandOutput) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = protocol::encode_result(index, output);
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}
