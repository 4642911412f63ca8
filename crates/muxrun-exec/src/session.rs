//! Persistent shell session speaking the coordinator protocol

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::{Batch, Mode};
use crate::bootstrap::{self, CoordinatorLaunch, LAUNCH_FAILED};
use crate::coordinator::DEFAULT_MAX_RUNTIME;
use crate::error::{BatchFailure, ExecError};
use crate::protocol::{self, READY_LINE, Reply};
use crate::result::CommandResult;
use crate::transport::Transport;

/// How a session starts and talks to the coordinator
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How the coordinator is started inside the shell
    pub coordinator: CoordinatorLaunch,
    /// Coordinator-side bound on one run (`None` disables it)
    pub max_runtime: Option<Duration>,
    /// How long to wait for the coordinator's ready line
    pub handshake_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorLaunch::default(),
            max_runtime: Some(DEFAULT_MAX_RUNTIME),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Live shell process and its pipes
struct Connection {
    child: Child,
    /// Group led by the shell; the coordinator and its commands share it
    pgid: Option<Pid>,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: JoinHandle<()>,
}

impl Connection {
    /// SIGKILL everything the shell started, then the shell itself
    fn kill(&mut self, host: &str) {
        if let Some(pgid) = self.pgid {
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                debug!(host = %host, error = %e, "process group already gone");
            }
        }
        if let Err(e) = self.child.start_kill() {
            debug!(host = %host, error = %e, "shell already exited");
        }
    }
}

/// One persistent shell on one host
///
/// The session is either disconnected or owns exactly one shell process.
/// Every failure tears the process down; the next use spawns a fresh one.
pub struct Session {
    host: String,
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    bootstrap: HashMap<Mode, String>,
    conn: Option<Connection>,
    sent: usize,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("transport", &self.transport.transport_type())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a disconnected session
    pub fn new(host: impl Into<String>, transport: Arc<dyn Transport>, options: SessionOptions) -> Self {
        Self {
            host: host.into(),
            transport,
            options,
            bootstrap: HashMap::new(),
            conn: None,
            sent: 0,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Spawn the shell process unless one is already running
    ///
    /// # Errors
    /// Returns `ExecError::SpawnError` if the transport command cannot start
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn connect(&mut self) -> Result<(), ExecError> {
        if self.conn.is_some() {
            return Ok(());
        }

        let mut cmd = self.transport.shell_command(&self.host);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(ExecError::SpawnError("shell pipes were not captured".to_string()));
            }
        };

        let pgid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw);

        let host = self.host.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(host = %host, line = %line, "session stderr");
            }
        });

        info!(
            host = %self.host,
            transport = self.transport.transport_type(),
            pid = child.id(),
            "session connected"
        );

        self.conn = Some(Connection {
            child,
            pgid,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            stderr_task,
        });
        Ok(())
    }

    /// Start the coordinator and hand it the batch
    ///
    /// On failure the session is closed before returning.
    ///
    /// # Errors
    /// Returns `ExecError::HandshakeFailed` if the coordinator could not be
    /// started or does not announce itself in time, or an I/O error from
    /// the pipes
    #[instrument(skip(self, batch), fields(host = %self.host, batch_size = batch.len()))]
    pub async fn send_batch(&mut self, batch: &Batch) -> Result<(), ExecError> {
        let sent = self.send_batch_inner(batch).await;
        if let Err(e) = &sent {
            warn!(host = %self.host, error = %e, "failed to send batch");
            self.close().await;
        }
        sent
    }

    async fn send_batch_inner(&mut self, batch: &Batch) -> Result<(), ExecError> {
        self.connect().await?;

        let mut bootstrap = self.bootstrap_line(batch.mode())?;
        bootstrap.push('\n');
        self.write(bootstrap.as_bytes()).await?;

        let handshake_timeout = self.options.handshake_timeout;
        match self.read_line(handshake_timeout).await {
            Ok(Some(line)) if line.trim_end() == READY_LINE => {}
            Ok(Some(line)) if line.starts_with(LAUNCH_FAILED) => {
                let status = line[LAUNCH_FAILED.len()..].trim();
                return Err(ExecError::HandshakeFailed(format!(
                    "coordinator did not start (exit status {status})"
                )));
            }
            Ok(Some(line)) => {
                return Err(ExecError::HandshakeFailed(format!(
                    "unexpected line {line:?}"
                )));
            }
            Ok(None) => {
                return Err(ExecError::HandshakeFailed(
                    "shell exited before the coordinator started".to_string(),
                ));
            }
            Err(e) => return Err(ExecError::HandshakeFailed(e.to_string())),
        }

        let mut payload = String::new();
        for line in batch.encoded_lines() {
            payload.push_str(line);
            payload.push('\n');
        }
        payload.push_str(protocol::DONE);
        payload.push('\n');
        self.write(payload.as_bytes()).await?;

        self.sent = batch.len();
        debug!(host = %self.host, count = self.sent, mode = %batch.mode(), "batch sent");
        Ok(())
    }

    /// Read results for the batch just sent
    ///
    /// Each read is bounded by `read_timeout`. The returned vector always has
    /// `batch_size` entries, indexed like the batch.
    ///
    /// # Errors
    /// On read timeout the session is closed and unfilled slots keep their
    /// `Timeout` default. On EOF or a protocol violation the session is
    /// closed and unfilled slots become `Error`. Both cases return the
    /// partial results inside `BatchFailure`.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn collect_results(
        &mut self,
        batch_size: usize,
        read_timeout: Duration,
    ) -> Result<Vec<CommandResult>, BatchFailure> {
        let mut results = vec![CommandResult::timeout(); batch_size];
        let mut filled = vec![false; batch_size];

        let error = loop {
            let line = match self.read_line(read_timeout).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    break ExecError::SessionClosed("EOF before the batch completed".to_string());
                }
                Err(e @ ExecError::Timeout { .. }) => {
                    debug!(host = %self.host, timeout = ?read_timeout, "command timeout");
                    self.close().await;
                    return Err(BatchFailure { error: e, results });
                }
                Err(e) => break e,
            };

            match protocol::decode_reply(&line) {
                Ok(Reply::Done) => {
                    self.sent = 0;
                    return Ok(results);
                }
                Ok(Reply::Result { index, output }) if index < batch_size => {
                    results[index] = CommandResult::Completed(output);
                    filled[index] = true;
                }
                Ok(Reply::Result { index, .. }) => {
                    break ExecError::Protocol(format!(
                        "result index {index} outside batch of {batch_size}"
                    ));
                }
                Err(e) => break e,
            }
        };

        error!(host = %self.host, error = %error, "session failed during batch");
        self.close().await;

        let message = format!("session failure on {}: {error}", self.host);
        for (slot, done) in results.iter_mut().zip(&filled) {
            if !done {
                *slot = CommandResult::error(message.clone());
            }
        }
        Err(BatchFailure { error, results })
    }

    /// Send a batch and collect its results
    ///
    /// # Errors
    /// Returns `BatchFailure` with one result per command if anything failed
    pub async fn exec_batch(
        &mut self,
        batch: &Batch,
        read_timeout: Duration,
    ) -> Result<Vec<CommandResult>, BatchFailure> {
        let start = Instant::now();

        if let Err(e) = self.send_batch(batch).await {
            return Err(BatchFailure::rejected(e, batch.len()));
        }
        let results = self.collect_results(batch.len(), read_timeout).await?;

        debug!(
            host = %self.host,
            batch_size = batch.len(),
            elapsed = ?start.elapsed(),
            "batch completed"
        );
        Ok(results)
    }

    /// Round-trip `echo ping` through the coordinator
    pub async fn ping(&mut self, timeout: Duration) -> bool {
        match self.exec_batch(&Batch::ping(), timeout).await {
            Ok(results) => results.first().and_then(CommandResult::output).is_some_and(|o| {
                o.success() && o.stdout_lossy().trim() == "ping"
            }),
            Err(failure) => {
                debug!(host = %self.host, error = %failure, "ping failed");
                false
            }
        }
    }

    /// Kill the shell's process group and forget it
    ///
    /// Commands still running in the batch die with the shell. Safe to call
    /// repeatedly; a disconnected session is left untouched.
    pub async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        self.sent = 0;

        drop(conn.stdin.take());
        conn.kill(&self.host);
        match conn.child.wait().await {
            Ok(status) => debug!(host = %self.host, status = %status, "shell reaped"),
            Err(e) => warn!(host = %self.host, error = %e, "failed to reap shell"),
        }
        conn.stderr_task.abort();

        info!(host = %self.host, "session closed");
    }

    fn bootstrap_line(&mut self, mode: Mode) -> Result<String, ExecError> {
        if let Some(line) = self.bootstrap.get(&mode) {
            return Ok(line.clone());
        }
        let line = bootstrap::bootstrap_line(&self.options.coordinator, mode, self.options.max_runtime)?;
        self.bootstrap.insert(mode, line.clone());
        Ok(line)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ExecError> {
        let conn = self.conn.as_mut().ok_or(ExecError::NotConnected)?;
        let stdin = conn.stdin.as_mut().ok_or(ExecError::NotConnected)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Next line from the shell, `None` on EOF
    async fn read_line(&mut self, limit: Duration) -> Result<Option<String>, ExecError> {
        let conn = self.conn.as_mut().ok_or(ExecError::NotConnected)?;
        match timeout(limit, conn.stdout.next_line()).await {
            Ok(line) => Ok(line?),
            Err(_) => Err(ExecError::Timeout { timeout: limit }),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(conn) = &mut self.conn {
            conn.kill(&self.host);
            conn.stderr_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalShell;

    /// Session whose "coordinator" is an inline shell script
    fn scripted(script: &str) -> Session {
        let options = SessionOptions {
            coordinator: CoordinatorLaunch::installed(["sh", "-c", script]),
            max_runtime: None,
            handshake_timeout: Duration::from_secs(2),
        };
        Session::new("local", Arc::new(LocalShell::new()), options)
    }

    const READ_INPUT: &str = "while read l; do [ \"$l\" = done ] && break; done";

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut session = scripted("true");
        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert!(session.is_connected());

        session.close().await;
        session.close().await;
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_canned_results_are_indexed() {
        // index 1 is reported before index 0
        let script = format!(
            "echo '{READY_LINE}'; {READ_INPUT}; \
             echo '{{\"index\":1,\"status\":0,\"stdout\":\"eAo=\",\"stderr\":\"\"}}'; \
             echo '{{\"index\":0,\"status\":2,\"stdout\":\"\",\"stderr\":\"YmFkCg==\"}}'; \
             echo done"
        );
        let mut session = scripted(&script);
        let batch = Batch::argv([vec!["false"], vec!["echo", "x"]]).unwrap();

        let results = session.exec_batch(&batch, Duration::from_secs(2)).await.unwrap();

        assert_eq!(results[0].status(), Some(2));
        assert_eq!(results[0].output().unwrap().stderr_lossy(), "bad\n");
        assert_eq!(results[1].output().unwrap().stdout_lossy(), "x\n");
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_missing_handshake_fails_batch() {
        let mut session = scripted("echo 'Welcome!'");
        let batch = Batch::argv([["true"]]).unwrap();

        let err = session.send_batch(&batch).await.unwrap_err();

        assert!(matches!(err, ExecError::HandshakeFailed(_)));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_silent_coordinator_times_out_handshake() {
        let mut session = scripted("sleep 5");
        let batch = Batch::argv([["true"]]).unwrap();

        let failure = session.exec_batch(&batch, Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(failure.error, ExecError::HandshakeFailed(_)));
        assert!(failure.results[0].is_error());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_read_timeout_keeps_partial_results() {
        let script = format!(
            "echo '{READY_LINE}'; {READ_INPUT}; \
             echo '{{\"index\":1,\"status\":0,\"stdout\":\"eAo=\",\"stderr\":\"\"}}'; \
             sleep 5"
        );
        let mut session = scripted(&script);
        let batch = Batch::argv([vec!["sleep", "5"], vec!["echo", "x"]]).unwrap();

        let failure = session
            .exec_batch(&batch, Duration::from_millis(500))
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ExecError::Timeout { .. }));
        assert_eq!(failure.results[0], CommandResult::timeout());
        assert_eq!(failure.results[1].output().unwrap().stdout_lossy(), "x\n");
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_protocol_violation_fails_pending_commands() {
        let script = format!(
            "echo '{READY_LINE}'; {READ_INPUT}; \
             echo '{{\"index\":0,\"status\":0,\"stdout\":\"\",\"stderr\":\"\"}}'; \
             echo 'Traceback (most recent call last):'"
        );
        let mut session = scripted(&script);
        let batch = Batch::argv([["true"], ["true"]]).unwrap();

        let failure = session.exec_batch(&batch, Duration::from_secs(2)).await.unwrap_err();

        assert!(matches!(failure.error, ExecError::Protocol(_)));
        assert!(failure.results[0].success());
        assert!(failure.results[1].is_error());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_a_violation() {
        let script = format!(
            "echo '{READY_LINE}'; {READ_INPUT}; \
             echo '{{\"index\":9,\"status\":0,\"stdout\":\"\",\"stderr\":\"\"}}'"
        );
        let mut session = scripted(&script);
        let batch = Batch::argv([["true"]]).unwrap();

        let failure = session.exec_batch(&batch, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(failure.error, ExecError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unreachable_transport_fails_ping() {
        let transport = crate::transport::RemoteShell::new("sh").with_args(["-c", "exit 255"]);
        let mut session = Session::new("unreachable-host", Arc::new(transport), SessionOptions::default());

        assert!(!session.ping(Duration::from_secs(2)).await);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_canned_ping() {
        let script = format!(
            "echo '{READY_LINE}'; {READ_INPUT}; \
             echo '{{\"index\":0,\"status\":0,\"stdout\":\"cGluZwo=\",\"stderr\":\"\"}}'; \
             echo done"
        );
        let mut session = scripted(&script);

        assert!(session.ping(Duration::from_secs(2)).await);
        // the same shell serves the next batch
        assert!(session.ping(Duration::from_secs(2)).await);
    }

    /// Session running the bundled coordinator through a local `sh`
    fn embedded(max_runtime: Option<Duration>) -> Session {
        let options = SessionOptions {
            max_runtime,
            ..SessionOptions::default()
        };
        Session::new("local", Arc::new(LocalShell::new()), options)
    }

    /// Whether `pid` has exited (a zombie counts)
    fn process_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    async fn wait_gone(pid: &str) -> bool {
        for _ in 0..40 {
            if process_gone(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn read_pid(path: &std::path::Path) -> String {
        for _ in 0..40 {
            if let Ok(pid) = std::fs::read_to_string(path) {
                if !pid.trim().is_empty() {
                    return pid.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[tokio::test]
    async fn test_embedded_coordinator_runs_batches() {
        let mut session = embedded(Some(Duration::from_secs(30)));

        let batch = Batch::argv([
            vec!["sh", "-c", "sleep 1; echo slow"],
            vec!["echo", "fast"],
            vec!["/nonexistent/muxrun-test-binary"],
            vec!["sh", "-c", "kill -9 $$"],
        ])
        .unwrap();
        let results = session.exec_batch(&batch, Duration::from_secs(10)).await.unwrap();

        assert_eq!(results[0].output().unwrap().stdout_lossy(), "slow\n");
        assert_eq!(results[1].output().unwrap().stdout_lossy(), "fast\n");
        assert_eq!(results[2].status(), Some(1));
        assert!(!results[2].output().unwrap().stderr.is_empty());
        assert_eq!(results[3].status(), Some(-9));

        // same shell, other mode
        let batch = Batch::shell(["printf 'a\\0b'; echo e >&2; exit 3"]).unwrap();
        let results = session.exec_batch(&batch, Duration::from_secs(10)).await.unwrap();

        let output = results[0].output().unwrap();
        assert_eq!(output.status, 3);
        assert_eq!(output.stdout, b"a\0b");
        assert_eq!(output.stderr, b"e\n");
        assert!(session.ping(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_missing_interpreter_fails_fast() {
        let options = SessionOptions {
            coordinator: CoordinatorLaunch::embedded("muxrun-no-such-python"),
            max_runtime: None,
            handshake_timeout: Duration::from_secs(10),
        };
        let mut session = Session::new("local", Arc::new(LocalShell::new()), options);
        let batch = Batch::argv([["true"]]).unwrap();

        let started = Instant::now();
        let err = session.send_batch(&batch).await.unwrap_err();

        assert!(matches!(err, ExecError::HandshakeFailed(ref m) if m.contains("127")), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_max_runtime_reports_unfinished_commands() {
        let mut session = embedded(Some(Duration::from_secs(1)));
        let batch = Batch::argv([vec!["sleep", "30"], vec!["echo", "x"]]).unwrap();

        let started = Instant::now();
        let results = session.exec_batch(&batch, Duration::from_secs(8)).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        let expired = results[0].output().unwrap();
        assert_eq!(expired.status, 124);
        assert_eq!(expired.stderr_lossy(), "max runtime exceeded");
        assert_eq!(results[1].output().unwrap().stdout_lossy(), "x\n");
        // the sentinel arrived, so the shell is reused
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_close_kills_running_commands() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!(
            "echo '{READY_LINE}'; {READ_INPUT}; sleep 30 & echo $! > '{}'; wait",
            pidfile.display()
        );
        let mut session = scripted(&script);
        let batch = Batch::argv([["sleep", "30"]]).unwrap();

        let failure = session
            .exec_batch(&batch, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ExecError::Timeout { .. }));

        let pid = read_pid(&pidfile).await;
        assert!(wait_gone(&pid).await, "process {pid} outlived the session");
    }

    #[tokio::test]
    async fn test_drop_kills_running_commands() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!(
            "echo '{READY_LINE}'; {READ_INPUT}; sleep 30 & echo $! > '{}'; wait",
            pidfile.display()
        );
        let mut session = scripted(&script);
        let batch = Batch::argv([["sleep", "30"]]).unwrap();
        session.send_batch(&batch).await.unwrap();

        let pid = read_pid(&pidfile).await;
        drop(session);
        assert!(wait_gone(&pid).await, "process {pid} outlived the session");
    }
}
