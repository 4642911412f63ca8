//! Transports that open a persistent shell on a host
//!
//! A transport only knows how to build the process; authentication, host key
//! checking and connection sharing belong to the external client it runs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::process::Command;

/// Builds the command whose stdin/stdout become a session's channel
pub trait Transport: Send + Sync + fmt::Debug {
    /// Command that opens a shell on `host` reading from stdin
    fn shell_command(&self, host: &str) -> Command;

    fn transport_type(&self) -> &'static str;
}

/// Plain local shell, used for addresses that name this machine
#[derive(Debug, Clone)]
pub struct LocalShell {
    shell: String,
}

impl LocalShell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell binary
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalShell {
    fn shell_command(&self, _host: &str) -> Command {
        Command::new(&self.shell)
    }

    fn transport_type(&self) -> &'static str {
        "local"
    }
}

/// Externally configured remote-shell client
///
/// Runs `<program> <args...> <host> <remote_shell>`.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    program: String,
    args: Vec<String>,
    remote_shell: String,
}

impl RemoteShell {
    /// Remote shell client with no extra arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            remote_shell: "sh".to_string(),
        }
    }

    /// Non-interactive `ssh` that never prompts
    #[must_use]
    pub fn ssh() -> Self {
        Self::new("ssh").with_args(["-o", "BatchMode=yes", "-o", "LogLevel=error"])
    }

    /// Arguments placed before the host
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Shell started on the remote side
    #[must_use]
    pub fn with_remote_shell(mut self, shell: impl Into<String>) -> Self {
        self.remote_shell = shell.into();
        self
    }
}

impl Transport for RemoteShell {
    fn shell_command(&self, host: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(host).arg(&self.remote_shell);
        cmd
    }

    fn transport_type(&self) -> &'static str {
        "remote"
    }
}

/// Picks the local shell or the remote transport for each address
#[derive(Debug, Clone)]
pub struct Transports {
    remote: Arc<dyn Transport>,
    local: Arc<dyn Transport>,
    local_addrs: HashSet<String>,
}

impl Transports {
    /// Route `local_addrs` to a local shell and everything else to `remote`
    pub fn new<I, S>(remote: Arc<dyn Transport>, local_addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            remote,
            local: Arc::new(LocalShell::new()),
            local_addrs: local_addrs.into_iter().map(Into::into).collect(),
        }
    }

    /// Replace the transport used for local addresses
    #[must_use]
    pub fn with_local(mut self, local: Arc<dyn Transport>) -> Self {
        self.local = local;
        self
    }

    #[must_use]
    pub fn is_local(&self, host: &str) -> bool {
        self.local_addrs.contains(host)
    }

    #[must_use]
    pub fn for_host(&self, host: &str) -> Arc<dyn Transport> {
        if self.is_local(host) {
            Arc::clone(&self.local)
        } else {
            Arc::clone(&self.remote)
        }
    }
}
