//! Result types for command execution

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Message carried by the default result of a command that never reported
pub const TIMEOUT_MESSAGE: &str = "command timeout";

/// Exit status and captured output of a finished command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit status code (0 for success, negative signal number if killed)
    pub status: i32,
    /// Raw stdout bytes
    pub stdout: Vec<u8>,
    /// Raw stderr bytes
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Create an output from its parts
    pub fn new(status: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Output for a command that could not be started
    pub fn start_failure(message: impl Into<String>) -> Self {
        Self {
            status: 1,
            stdout: Vec::new(),
            stderr: message.into().into_bytes(),
        }
    }

    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// stderr decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Outcome of one command in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// The command ran and was reaped
    Completed(CommandOutput),
    /// No result arrived before the session timed out
    Timeout(String),
    /// The result could not be obtained
    Error(String),
}

impl CommandResult {
    /// Default value for a slot that has not been filled yet
    #[must_use]
    pub fn timeout() -> Self {
        CommandResult::Timeout(TIMEOUT_MESSAGE.to_string())
    }

    /// Error result with a descriptive message
    pub fn error(message: impl Into<String>) -> Self {
        CommandResult::Error(message.into())
    }

    /// The captured output, if the command completed
    #[must_use]
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            CommandResult::Completed(output) => Some(output),
            CommandResult::Timeout(_) | CommandResult::Error(_) => None,
        }
    }

    /// Exit status, if the command completed
    #[must_use]
    pub fn status(&self) -> Option<i32> {
        self.output().map(|o| o.status)
    }

    /// Completed with exit code 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.output().is_some_and(CommandOutput::success)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandResult::Timeout(_))
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, CommandResult::Error(_))
    }

    /// Message of a `Timeout` or `Error` result
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            CommandResult::Completed(_) => None,
            CommandResult::Timeout(msg) | CommandResult::Error(msg) => Some(msg),
        }
    }
}

impl From<CommandOutput> for CommandResult {
    fn from(output: CommandOutput) -> Self {
        CommandResult::Completed(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_failure_is_nonzero() {
        let output = CommandOutput::start_failure("No such file or directory");

        assert!(!output.success());
        assert!(output.stdout.is_empty());
        assert_eq!(output.stderr_lossy(), "No such file or directory");
    }

    #[test]
    fn test_result_accessors() {
        let done = CommandResult::from(CommandOutput::new(0, "x\n", ""));
        assert!(done.success());
        assert_eq!(done.status(), Some(0));
        assert_eq!(done.message(), None);

        let timeout = CommandResult::timeout();
        assert!(timeout.is_timeout());
        assert_eq!(timeout.message(), Some(TIMEOUT_MESSAGE));
        assert_eq!(timeout.status(), None);

        let error = CommandResult::error("host h1 is not alive");
        assert!(error.is_error());
        assert!(!error.success());
    }

    #[test]
    fn test_lossy_output_replaces_invalid_utf8() {
        let output = CommandOutput::new(0, vec![b'o', b'k', 0xff], Vec::new());
        assert_eq!(output.stdout_lossy(), "ok\u{fffd}");
    }
}
