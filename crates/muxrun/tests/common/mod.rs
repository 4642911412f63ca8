#![allow(dead_code)]

use std::sync::Arc;

use muxrun_core::{Dispatcher, DispatcherConfig};
use muxrun_exec::RemoteShell;

pub const MUXRUN: &str = env!("CARGO_BIN_EXE_muxrun");

/// Addresses served by a local shell in these tests
pub const LOCAL_HOSTS: [&str; 3] = ["local", "h1", "h2"];

/// Config whose sessions start the freshly built coordinator
pub fn local_config() -> DispatcherConfig {
    let mut config = DispatcherConfig {
        local_addrs: LOCAL_HOSTS.iter().map(ToString::to_string).collect(),
        ..DispatcherConfig::default()
    };
    config.coordinator.command = vec![MUXRUN.to_string(), "coordinator".to_string()];
    config.worker.idle_probe_interval_secs = 0;
    config.worker.failure_backoff_ms = 10;
    config.worker.read_timeout_secs = 10;
    config.worker.ping_timeout_secs = 5;
    config.worker.handshake_timeout_secs = 5;
    config
}

pub fn local_dispatcher() -> Dispatcher {
    Dispatcher::new(local_config())
}

/// Config that sends the bundled coordinator instead of using the binary
pub fn bundled_config() -> DispatcherConfig {
    let mut config = local_config();
    config.coordinator.command.clear();
    config
}

/// Non-local addresses go through a client that always fails to connect
pub fn unreachable_dispatcher() -> Dispatcher {
    let transport = RemoteShell::new("sh").with_args(["-c", "exit 255"]);
    Dispatcher::with_transport(local_config(), Arc::new(transport))
}
