//! Commands and batches

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::protocol;

/// How the coordinator starts each command of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Execute an argv list directly
    #[default]
    Argv,
    /// Pass a single string to `/bin/sh -c`
    Shell,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Argv => "argv",
            Mode::Shell => "shell",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "argv" => Ok(Mode::Argv),
            "shell" => Ok(Mode::Shell),
            other => Err(ExecError::ConfigError(format!("unknown mode: {other}"))),
        }
    }
}

/// A single command to run on a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Program and arguments
    Argv(Vec<String>),
    /// Shell string
    Shell(String),
}

impl Command {
    /// Build an argv command
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Build a shell-string command
    pub fn shell(script: impl Into<String>) -> Self {
        Command::Shell(script.into())
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        match self {
            Command::Argv(_) => Mode::Argv,
            Command::Shell(_) => Mode::Shell,
        }
    }

    fn validate(&self) -> Result<(), ExecError> {
        match self {
            Command::Argv(args) => {
                let program = args
                    .first()
                    .ok_or_else(|| ExecError::InvalidBatch("empty argv".to_string()))?;
                if program.is_empty() {
                    return Err(ExecError::InvalidBatch("empty program name".to_string()));
                }
                if args.iter().any(|a| a.contains('\0')) {
                    return Err(ExecError::InvalidBatch(
                        "argument contains a NUL byte".to_string(),
                    ));
                }
            }
            Command::Shell(script) => {
                if script.contains('\0') {
                    return Err(ExecError::InvalidBatch(
                        "shell string contains a NUL byte".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Ordered group of commands for one host
///
/// A command's position is its index; results come back in the same order.
/// Commands are validated and wire-encoded up front so a malformed command
/// fails before anything is queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    mode: Mode,
    lines: Vec<String>,
}

impl Batch {
    /// Create a batch in `mode`
    ///
    /// # Errors
    /// Returns `ExecError::InvalidBatch` if a command does not match `mode`
    /// or cannot be encoded
    pub fn new(mode: Mode, commands: Vec<Command>) -> Result<Self, ExecError> {
        let mut lines = Vec::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            if command.mode() != mode {
                return Err(ExecError::InvalidBatch(format!(
                    "command {index} is a {} command in a {mode} batch",
                    command.mode()
                )));
            }
            command.validate()?;
            lines.push(protocol::encode_command(command)?);
        }
        Ok(Self { mode, lines })
    }

    /// Batch of argv commands
    ///
    /// # Errors
    /// Returns `ExecError::InvalidBatch` for an empty or malformed argv
    pub fn argv<I, C, S>(commands: I) -> Result<Self, ExecError>
    where
        I: IntoIterator<Item = C>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Mode::Argv, commands.into_iter().map(Command::argv).collect())
    }

    /// Batch of shell strings
    ///
    /// # Errors
    /// Returns `ExecError::InvalidBatch` if a string contains a NUL byte
    pub fn shell<I, S>(commands: I) -> Result<Self, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Mode::Shell, commands.into_iter().map(Command::shell).collect())
    }

    /// Single `echo ping`, used as the liveness probe
    pub(crate) fn ping() -> Self {
        Self {
            mode: Mode::Argv,
            lines: vec![r#"["echo","ping"]"#.to_string()],
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// One protocol line per command, without trailing newlines
    #[must_use]
    pub fn encoded_lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
