//! Configuration types for the dispatcher and its workers

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use muxrun_exec::bootstrap::DEFAULT_INTERPRETER;
use muxrun_exec::{CoordinatorLaunch, LocalShell, RemoteShell, SessionOptions, Transport};

/// Top-level dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Addresses served by a local shell instead of the remote transport
    #[serde(default = "default_local_addrs")]
    pub local_addrs: Vec<String>,
    /// Remote shell client
    #[serde(default)]
    pub transport: TransportConfig,
    /// How the coordinator is started inside a session
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Per-host worker settings
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Capacity of the host event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_local_addrs() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string(), "::1".to_string()]
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            local_addrs: default_local_addrs(),
            transport: TransportConfig::default(),
            coordinator: CoordinatorConfig::default(),
            worker: WorkerConfig::default(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl DispatcherConfig {
    /// Session options derived from coordinator and worker settings
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            coordinator: self.coordinator.launch(),
            max_runtime: self.coordinator.max_runtime(),
            handshake_timeout: self.worker.handshake_timeout(),
        }
    }
}

/// Remote shell client invocation: `<program> <args...> <host> <remote_shell>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_transport_args")]
    pub args: Vec<String>,
    /// Shell started on the remote host
    #[serde(default = "default_remote_shell")]
    pub remote_shell: String,
    /// Shell started for local addresses
    #[serde(default = "default_local_shell")]
    pub local_shell: String,
}

fn default_program() -> String {
    "ssh".to_string()
}

fn default_transport_args() -> Vec<String> {
    ["-o", "BatchMode=yes", "-o", "LogLevel=error"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_remote_shell() -> String {
    "sh".to_string()
}

fn default_local_shell() -> String {
    "sh".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_transport_args(),
            remote_shell: default_remote_shell(),
            local_shell: default_local_shell(),
        }
    }
}

impl TransportConfig {
    /// Build the remote transport
    #[must_use]
    pub fn build(&self) -> Arc<dyn Transport> {
        Arc::new(
            RemoteShell::new(&self.program)
                .with_args(self.args.iter().cloned())
                .with_remote_shell(&self.remote_shell),
        )
    }

    /// Build the transport for local addresses
    #[must_use]
    pub fn build_local(&self) -> Arc<dyn Transport> {
        Arc::new(LocalShell::new().with_shell(&self.local_shell))
    }
}

/// Coordinator invocation inside a session
///
/// With an empty `command` the bundled coordinator is sent through the shell
/// and run by `interpreter`, so nothing has to be installed on the host. A
/// non-empty `command` runs an installed coordinator instead, such as
/// `["muxrun", "coordinator"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Interpreter on the target host that runs the bundled coordinator
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Argv of an installed coordinator, empty for the bundled one
    #[serde(default)]
    pub command: Vec<String>,
    /// Coordinator-side bound on one batch, 0 disables it
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,
}

fn default_interpreter() -> String {
    DEFAULT_INTERPRETER.to_string()
}

fn default_max_runtime_secs() -> u64 {
    120
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            command: Vec::new(),
            max_runtime_secs: default_max_runtime_secs(),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn launch(&self) -> CoordinatorLaunch {
        if self.command.is_empty() {
            CoordinatorLaunch::embedded(&self.interpreter)
        } else {
            CoordinatorLaunch::Installed(self.command.clone())
        }
    }

    #[must_use]
    pub fn max_runtime(&self) -> Option<Duration> {
        (self.max_runtime_secs > 0).then(|| Duration::from_secs(self.max_runtime_secs))
    }
}

/// Per-host worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Bound on each result line read during a batch
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Bound on the coordinator's ready line
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Bound on each liveness probe read
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Idle time after which a worker re-probes its host, 0 disables
    #[serde(default = "default_idle_probe_interval_secs")]
    pub idle_probe_interval_secs: u64,
    /// Pause after a failed batch
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    /// Skip the pre-batch probe if the host proved alive this recently
    #[serde(default)]
    pub liveness_grace_secs: u64,
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_idle_probe_interval_secs() -> u64 {
    30
}

fn default_failure_backoff_ms() -> u64 {
    2000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            idle_probe_interval_secs: default_idle_probe_interval_secs(),
            failure_backoff_ms: default_failure_backoff_ms(),
            liveness_grace_secs: 0,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// `None` when idle probing is disabled
    #[must_use]
    pub fn idle_probe_interval(&self) -> Option<Duration> {
        (self.idle_probe_interval_secs > 0)
            .then(|| Duration::from_secs(self.idle_probe_interval_secs))
    }

    #[must_use]
    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    #[must_use]
    pub fn liveness_grace(&self) -> Duration {
        Duration::from_secs(self.liveness_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = DispatcherConfig::default();

        assert_eq!(config.worker.read_timeout(), Duration::from_secs(60));
        assert_eq!(config.worker.failure_backoff(), Duration::from_secs(2));
        assert!(config.worker.liveness_grace().is_zero());
        assert_eq!(config.coordinator.max_runtime(), Some(Duration::from_secs(120)));
        assert!(config.local_addrs.contains(&"localhost".to_string()));
    }

    #[test]
    fn test_zero_disables_optional_bounds() {
        let coordinator = CoordinatorConfig {
            max_runtime_secs: 0,
            ..CoordinatorConfig::default()
        };
        let worker = WorkerConfig {
            idle_probe_interval_secs: 0,
            ..WorkerConfig::default()
        };

        assert_eq!(coordinator.max_runtime(), None);
        assert_eq!(worker.idle_probe_interval(), None);
    }

    #[test]
    fn test_session_options() {
        let mut config = DispatcherConfig::default();
        config.coordinator.command = vec!["/usr/local/bin/muxrun".into(), "coordinator".into()];
        config.worker.handshake_timeout_secs = 3;

        let options = config.session_options();
        assert_eq!(
            options.coordinator,
            CoordinatorLaunch::installed(["/usr/local/bin/muxrun", "coordinator"])
        );
        assert_eq!(options.handshake_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_bundled_coordinator_by_default() {
        let mut config = DispatcherConfig::default();
        assert_eq!(config.coordinator.launch(), CoordinatorLaunch::embedded("python3"));

        config.coordinator.interpreter = "/usr/bin/python3.12".to_string();
        assert_eq!(
            config.session_options().coordinator,
            CoordinatorLaunch::embedded("/usr/bin/python3.12")
        );
    }
}
