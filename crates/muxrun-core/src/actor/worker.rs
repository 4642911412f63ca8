//! `HostWorker`: per-host serial executor
//!
//! Owns the host's session and liveness state. The actor mailbox is the FIFO
//! work queue, so at most one batch is in flight per host.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kameo::actor::{ActorRef, Spawn, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::mailbox;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use muxrun_exec::{Batch, CommandResult, Session, SessionOptions, Transport};

use crate::config::WorkerConfig;
use crate::error::CoreError;
use crate::message::{HostEvent, IdleProbe, Probe, RunBatch};
use crate::state::{Liveness, LivenessState};

/// Arguments for spawning a `HostWorker`
pub struct HostWorkerArgs {
    /// Host address
    pub host: String,
    /// Transport used to open the host's shell
    pub transport: Arc<dyn Transport>,
    /// How the session starts the coordinator
    pub session_options: SessionOptions,
    /// Worker timing settings
    pub config: WorkerConfig,
    /// Where liveness changes are published
    pub liveness_tx: watch::Sender<LivenessState>,
    /// Event broadcast sender
    pub event_tx: broadcast::Sender<HostEvent>,
}

/// Per-host actor running batches over one session
pub struct HostWorker {
    host: String,
    session: Session,
    config: WorkerConfig,
    liveness: Liveness,
    /// Last successful probe or batch
    last_success: Option<Instant>,
    /// Last time the worker finished handling work
    last_activity: Instant,
    liveness_tx: watch::Sender<LivenessState>,
    event_tx: broadcast::Sender<HostEvent>,
    idle_task: Option<JoinHandle<()>>,
}

impl HostWorker {
    fn set_liveness(&mut self, next: Liveness) {
        if self.liveness == next || !self.liveness.can_transition_to(next) {
            return;
        }

        let previous = self.liveness;
        self.liveness = next;

        info!(
            host = %self.host,
            from = %previous,
            to = %next,
            "liveness changed"
        );

        self.liveness_tx.send_replace(LivenessState::new(next));
        // No subscribers is fine
        let _ = self.event_tx.send(HostEvent::LivenessChanged {
            host: self.host.clone(),
            from: previous,
            to: next,
        });
    }

    /// Reconnect unless known alive, then round-trip a ping
    async fn probe(&mut self) -> Liveness {
        if self.liveness != Liveness::Alive {
            self.session.close().await;
        }

        let alive = self.session.ping(self.config.ping_timeout()).await;
        if alive {
            self.last_success = Some(Instant::now());
            self.set_liveness(Liveness::Alive);
        } else {
            debug!(host = %self.host, "host is not alive");
            self.set_liveness(Liveness::Dead);
        }
        self.liveness
    }

    /// Probe before a batch unless the host proved alive within the grace window
    async fn ensure_alive(&mut self) -> Liveness {
        let grace = self.config.liveness_grace();
        let fresh = self
            .last_success
            .is_some_and(|at| at.elapsed() < grace);

        if self.liveness == Liveness::Alive && fresh {
            debug!(host = %self.host, grace = ?grace, "skipping probe");
            return self.liveness;
        }
        self.probe().await
    }

    async fn run_batch(&mut self, batch: &Batch) -> Vec<CommandResult> {
        if !self.ensure_alive().await.is_alive() {
            warn!(host = %self.host, batch_size = batch.len(), "rejecting batch for dead host");
            let message = format!("host {} is not alive", self.host);
            return vec![CommandResult::error(message); batch.len()];
        }

        match self.session.exec_batch(batch, self.config.read_timeout()).await {
            Ok(results) => {
                self.last_success = Some(Instant::now());
                results
            }
            Err(failure) => {
                error!(
                    host = %self.host,
                    error = %failure.error,
                    "batch failed, marking host dead"
                );
                self.set_liveness(Liveness::Dead);
                tokio::time::sleep(self.config.failure_backoff()).await;
                failure.results
            }
        }
    }
}

/// Tell the worker `IdleProbe` every `every` until it goes away
fn spawn_idle_ticker(worker: WeakActorRef<HostWorker>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(actor) = worker.upgrade() else {
                break;
            };
            if actor.tell(IdleProbe).await.is_err() {
                break;
            }
        }
    })
}

impl Actor for HostWorker {
    type Args = HostWorkerArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(host = %args.host, id = %actor_ref.id(), "HostWorker starting");

        let idle_task = args
            .config
            .idle_probe_interval()
            .map(|every| spawn_idle_ticker(actor_ref.downgrade(), every));

        let _ = args.event_tx.send(HostEvent::WorkerStarted {
            host: args.host.clone(),
        });

        Ok(Self {
            session: Session::new(args.host.clone(), args.transport, args.session_options),
            host: args.host,
            config: args.config,
            liveness: Liveness::Unknown,
            last_success: None,
            last_activity: Instant::now(),
            liveness_tx: args.liveness_tx,
            event_tx: args.event_tx,
            idle_task,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(
            host = %self.host,
            reason = ?reason,
            "HostWorker stopping"
        );

        if let Some(task) = self.idle_task.take() {
            task.abort();
        }
        self.session.close().await;

        let _ = self.event_tx.send(HostEvent::WorkerStopped {
            host: self.host.clone(),
            reason: format!("{reason:?}"),
        });

        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RunBatch> for HostWorker {
    type Reply = ();

    async fn handle(&mut self, msg: RunBatch, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let RunBatch { batch, reply } = msg;

        let results = self.run_batch(&batch).await;
        self.last_activity = Instant::now();

        if reply.send(results).is_err() {
            debug!(host = %self.host, "caller stopped waiting for results");
        }
    }
}

impl Message<IdleProbe> for HostWorker {
    type Reply = ();

    async fn handle(&mut self, _msg: IdleProbe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let Some(interval) = self.config.idle_probe_interval() else {
            return;
        };
        if self.last_activity.elapsed() < interval {
            return;
        }

        debug!(host = %self.host, "idle, re-probing");
        self.probe().await;
        self.last_activity = Instant::now();
    }
}

impl Message<Probe> for HostWorker {
    type Reply = Liveness;

    async fn handle(&mut self, _msg: Probe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let liveness = self.probe().await;
        self.last_activity = Instant::now();
        liveness
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Caller-side handle to a running `HostWorker`
#[derive(Clone)]
pub struct HostHandle {
    host: String,
    actor: ActorRef<HostWorker>,
    liveness: watch::Receiver<LivenessState>,
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("host", &self.host)
            .field("id", &self.actor.id())
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl HostHandle {
    /// Spawn a worker for `host`
    ///
    /// The mailbox is unbounded so queueing never waits on a busy host.
    pub fn spawn(
        host: impl Into<String>,
        transport: Arc<dyn Transport>,
        session_options: SessionOptions,
        config: WorkerConfig,
        event_tx: broadcast::Sender<HostEvent>,
    ) -> Self {
        let host = host.into();
        let (liveness_tx, liveness) = watch::channel(LivenessState::default());

        let actor = HostWorker::spawn_with_mailbox(
            HostWorkerArgs {
                host: host.clone(),
                transport,
                session_options,
                config,
                liveness_tx,
                event_tx,
            },
            mailbox::unbounded(),
        );

        Self {
            host,
            actor,
            liveness,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether two handles refer to the same worker
    #[must_use]
    pub fn same_worker(&self, other: &HostHandle) -> bool {
        self.actor.id() == other.actor.id()
    }

    /// Current liveness, readable while the worker is busy
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.liveness.borrow().liveness
    }

    #[must_use]
    pub fn liveness_state(&self) -> LivenessState {
        *self.liveness.borrow()
    }

    /// Queue a batch without waiting; results arrive on `reply`
    ///
    /// # Errors
    /// Returns `CoreError::ActorError` if the worker is no longer running
    pub fn enqueue(
        &self,
        batch: Batch,
        reply: oneshot::Sender<Vec<CommandResult>>,
    ) -> Result<(), CoreError> {
        self.actor
            .tell(RunBatch { batch, reply })
            .try_send()
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    /// Probe the host after any queued work
    ///
    /// # Errors
    /// Returns `CoreError::ActorError` if the worker is no longer running
    pub async fn probe(&self) -> Result<Liveness, CoreError> {
        self.actor
            .ask(Probe)
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    /// Stop after already queued work; repeated calls are no-ops
    pub async fn shutdown(&self) {
        if let Err(e) = self.actor.stop_gracefully().await {
            debug!(host = %self.host, error = %e, "worker already stopped");
        }
    }

    /// Stop immediately, abandoning the batch in flight
    ///
    /// Dropping the worker drops its session, which kills the shell process.
    pub fn kill(&self) {
        self.actor.kill();
    }
}
