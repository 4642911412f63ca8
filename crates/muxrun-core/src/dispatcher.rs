//! `Dispatcher`: host-keyed registry of workers
//!
//! Entry point for callers. Workers are created on first reference to a host
//! and run independently, so hosts never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use muxrun_exec::{Batch, Command, CommandResult, Mode, SessionOptions, Transport, Transports};

use crate::actor::HostHandle;
use crate::config::DispatcherConfig;
use crate::error::CoreError;
use crate::message::HostEvent;
use crate::state::{HostStatus, Liveness};

/// Message of the results returned when a host misses the caller's deadline
pub const HOST_TIMEOUT_MESSAGE: &str = "host timeout";

const RESULT_BUFFER: usize = 64;

/// Registry of per-host workers
///
/// Cloning is cheap; clones share the same workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: DispatcherConfig,
    transports: Transports,
    session_options: SessionOptions,
    hosts: Mutex<HashMap<String, HostHandle>>,
    event_tx: broadcast::Sender<HostEvent>,
}

/// A batch handed to a worker whose results are not in yet
struct Pending {
    worker: HostHandle,
    batch_size: usize,
    reply: Result<oneshot::Receiver<Vec<CommandResult>>, CoreError>,
}

impl Dispatcher {
    /// Dispatcher using the configured remote transport
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        let remote = config.transport.build();
        Self::with_transport(config, remote)
    }

    /// Dispatcher using `remote` for every non-local address
    #[must_use]
    pub fn with_transport(config: DispatcherConfig, remote: Arc<dyn Transport>) -> Self {
        let transports = Transports::new(remote, config.local_addrs.iter().cloned())
            .with_local(config.transport.build_local());
        Self::with_transports(config, transports)
    }

    /// Dispatcher with explicit transport routing
    #[must_use]
    pub fn with_transports(config: DispatcherConfig, transports: Transports) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let session_options = config.session_options();

        Self {
            inner: Arc::new(Inner {
                config,
                transports,
                session_options,
                hosts: Mutex::new(HashMap::new()),
                event_tx,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Receive worker lifecycle and liveness events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.event_tx.subscribe()
    }

    #[must_use]
    pub fn is_local(&self, host: &str) -> bool {
        self.inner.transports.is_local(host)
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<String, HostHandle>> {
        self.inner
            .hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker for `host`, spawned on first use
    fn worker(&self, host: &str) -> HostHandle {
        let mut hosts = self.hosts();
        if let Some(worker) = hosts.get(host) {
            return worker.clone();
        }

        let worker = HostHandle::spawn(
            host,
            self.inner.transports.for_host(host),
            self.inner.session_options.clone(),
            self.inner.config.worker.clone(),
            self.inner.event_tx.clone(),
        );
        info!(host = %host, local = self.is_local(host), "spawned HostWorker");
        hosts.insert(host.to_string(), worker.clone());
        worker
    }

    /// Forget `worker` if it is still the one registered for its host
    fn forget(&self, worker: &HostHandle) {
        let mut hosts = self.hosts();
        if hosts
            .get(worker.host())
            .is_some_and(|current| current.same_worker(worker))
        {
            hosts.remove(worker.host());
        }
    }

    fn enqueue(&self, host: &str, batch: Batch) -> Pending {
        let worker = self.worker(host);
        let batch_size = batch.len();
        let (tx, rx) = oneshot::channel();
        let reply = worker.enqueue(batch, tx).map(|()| rx);

        Pending {
            worker,
            batch_size,
            reply,
        }
    }

    /// Wait for a pending batch, tearing the worker down if it misses `timeout`
    async fn wait(&self, pending: Pending, timeout: Duration) -> Vec<CommandResult> {
        let Pending {
            worker,
            batch_size,
            reply,
        } = pending;
        let host = worker.host().to_string();

        let rx = match reply {
            Ok(rx) => rx,
            Err(e) => {
                warn!(host = %host, error = %e, "worker unavailable");
                self.forget(&worker);
                return padded(batch_size, format!("worker for {host} unavailable: {e}"));
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(results)) => results,
            Ok(Err(_)) => {
                warn!(host = %host, "worker stopped before replying");
                self.forget(&worker);
                padded(batch_size, format!("worker for {host} stopped before replying"))
            }
            Err(_) => {
                warn!(host = %host, timeout = ?timeout, "host timeout, dropping worker");
                self.forget(&worker);
                worker.kill();
                padded(batch_size, HOST_TIMEOUT_MESSAGE)
            }
        }
    }

    /// Run a single command on `host`
    ///
    /// # Errors
    /// Returns `CoreError::Exec` if the command cannot be encoded
    pub async fn submit_one(
        &self,
        host: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandResult, CoreError> {
        let batch = Batch::new(command.mode(), vec![command])?;
        let results = self.submit_batch(host, batch, timeout).await;
        Ok(results
            .into_iter()
            .next()
            .unwrap_or_else(|| CommandResult::error("no result")))
    }

    /// Run a batch on `host` and wait up to `timeout` for all of its results
    ///
    /// The returned vector always has one entry per command. If the host
    /// misses the deadline its worker is killed and removed, and every entry
    /// is an `Error` carrying [`HOST_TIMEOUT_MESSAGE`].
    pub async fn submit_batch(
        &self,
        host: &str,
        batch: Batch,
        timeout: Duration,
    ) -> Vec<CommandResult> {
        let pending = self.enqueue(host, batch);
        self.wait(pending, timeout).await
    }

    /// Run commands spread over many hosts, one batch per host
    ///
    /// Results stream out per host in batch order as each host finishes;
    /// there is no ordering across hosts.
    ///
    /// # Errors
    /// Returns `CoreError::Exec` if any command does not match `mode`; nothing
    /// is queued in that case
    pub async fn submit_multi_host<I, H>(
        &self,
        pairs: I,
        mode: Mode,
        timeout: Duration,
    ) -> Result<ReceiverStream<(String, CommandResult)>, CoreError>
    where
        I: IntoIterator<Item = (H, Command)>,
        H: Into<String>,
    {
        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<Command>> = HashMap::new();
        for (host, command) in pairs {
            let host = host.into();
            grouped
                .entry(host.clone())
                .or_insert_with(|| {
                    order.push(host.clone());
                    Vec::new()
                })
                .push(command);
        }

        let batches = order
            .into_iter()
            .map(|host| {
                let commands = grouped.remove(&host).unwrap_or_default();
                Batch::new(mode, commands).map(|batch| (host, batch))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut pending = Vec::with_capacity(batches.len());
        for (host, batch) in batches {
            pending.push(self.enqueue(&host, batch));
        }

        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        for item in pending {
            let dispatcher = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let host = item.worker.host().to_string();
                for result in dispatcher.wait(item, timeout).await {
                    if tx.send((host.clone(), result)).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(ReceiverStream::new(rx))
    }

    /// Probe `host` now, spawning its worker if needed
    ///
    /// # Errors
    /// Returns `CoreError::ActorError` if the worker is not running
    pub async fn probe(&self, host: &str) -> Result<Liveness, CoreError> {
        self.worker(host).probe().await
    }

    /// Liveness of a tracked host, local or not
    #[must_use]
    pub fn liveness(&self, host: &str) -> Option<Liveness> {
        self.hosts().get(host).map(HostHandle::liveness)
    }

    /// Addresses with a running worker
    #[must_use]
    pub fn tracked_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.hosts().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Liveness snapshot of every tracked remote host
    #[must_use]
    pub fn host_statuses(&self) -> Vec<HostStatus> {
        let mut statuses: Vec<HostStatus> = self
            .hosts()
            .values()
            .filter(|worker| !self.is_local(worker.host()))
            .map(|worker| {
                let state = worker.liveness_state();
                HostStatus {
                    host: worker.host().to_string(),
                    liveness: state.liveness,
                    since: state.since,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.host.cmp(&b.host));
        statuses
    }

    /// Stop the worker for `host` after its queued work
    ///
    /// # Errors
    /// Returns `CoreError::HostNotFound` if no worker is tracked for `host`
    pub async fn shutdown(&self, host: &str) -> Result<(), CoreError> {
        let worker = self
            .hosts()
            .remove(host)
            .ok_or_else(|| CoreError::HostNotFound(host.to_string()))?;
        worker.shutdown().await;
        info!(host = %host, "worker shut down");
        Ok(())
    }

    /// Stop and forget every worker
    pub async fn shutdown_all(&self) {
        let workers: Vec<HostHandle> = self.hosts().drain().map(|(_, w)| w).collect();
        for worker in workers {
            info!(host = %worker.host(), "stopping HostWorker");
            worker.shutdown().await;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let hosts = self
            .hosts
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, worker) in hosts.drain() {
            worker.kill();
        }
    }
}

fn padded(batch_size: usize, message: impl Into<String>) -> Vec<CommandResult> {
    vec![CommandResult::error(message); batch_size]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_matches_batch_size() {
        let results = padded(3, HOST_TIMEOUT_MESSAGE);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.message() == Some(HOST_TIMEOUT_MESSAGE)));
    }

    #[tokio::test]
    async fn test_local_addresses_are_not_reported() {
        let config = DispatcherConfig {
            local_addrs: vec!["local".to_string()],
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(config);

        assert!(dispatcher.is_local("local"));
        assert!(!dispatcher.is_local("web1"));
        assert!(dispatcher.host_statuses().is_empty());
        assert!(dispatcher.tracked_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_unknown_host() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let err = dispatcher.shutdown("nowhere").await.unwrap_err();
        assert!(matches!(err, CoreError::HostNotFound(_)));
    }
}
