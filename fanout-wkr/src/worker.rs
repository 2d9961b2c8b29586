//! Per-machine supervisor.
//!
//! A worker owns one transport up to the coordinator and one transport down
//! to each runner slot. Two kinds of loop run concurrently:
//!
//! - the from-master loop hands each `RunJob` to an idle slot, waiting for
//!   one if necessary, and starts the teardown on `Shutdown`;
//! - one loop per slot relays `RequestJob` and `Result` upward, marking the
//!   slot idle as it does.

use crate::executor::JobExecutor;
use crate::runner::{Runner, RunnerExit};
use fanout_common::transport::{Received, spawn_local};
use fanout_common::{Message, Role, Transport, TransportError};
use futures::future::join_all;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a runner process gets to exit after its transport closes.
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to launch runner for slot {slot}: {source}")]
    Launch {
        slot: usize,
        #[source]
        source: TransportError,
    },

    #[error("Failed to locate the worker binary: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Tracks which runner slots are idle.
///
/// A slot becomes idle when its runner asks for work and busy when a job is
/// handed to it. [`acquire`](Self::acquire) waits without spinning.
#[derive(Debug)]
pub struct SlotPool {
    idle: Mutex<Vec<bool>>,
    available: Notify,
}

impl SlotPool {
    /// All slots start busy: a runner is idle only once it has asked for work.
    pub fn new(slots: usize) -> Self {
        Self {
            idle: Mutex::new(vec![false; slots]),
            available: Notify::new(),
        }
    }

    /// Claim an idle slot, if any.
    pub fn try_acquire(&self) -> Option<usize> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let slot = idle.iter().position(|&is_idle| is_idle)?;
        idle[slot] = false;
        Some(slot)
    }

    /// Wait for and claim an idle slot.
    pub async fn acquire(&self) -> usize {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not missed.
            notified.as_mut().enable();
            if let Some(slot) = self.try_acquire() {
                return slot;
            }
            notified.await;
        }
    }

    pub fn release(&self, slot: usize) {
        {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = idle.get_mut(slot) {
                *entry = true;
            }
        }
        self.available.notify_one();
    }

    pub fn idle_count(&self) -> usize {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.iter().filter(|&&is_idle| is_idle).count()
    }
}

/// What a worker has to wait for once a runner's transport is closed.
pub enum RunnerHandle {
    Process(Child),
    Task(JoinHandle<RunnerExit>),
}

impl RunnerHandle {
    async fn reap(self, slot: usize) {
        match self {
            Self::Process(mut child) => match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(slot, %status, "Runner exited"),
                Ok(Err(err)) => warn!(slot, "Failed to wait for runner: {}", err),
                Err(_) => {
                    warn!(slot, "Runner did not exit in time, killing it");
                    let _ = child.kill().await;
                }
            },
            Self::Task(handle) => match tokio::time::timeout(REAP_TIMEOUT, handle).await {
                Ok(Ok(exit)) => debug!(slot, ?exit, "Runner task finished"),
                Ok(Err(err)) => warn!(slot, "Runner task failed: {}", err),
                Err(_) => warn!(slot, "Runner task did not finish in time"),
            },
        }
    }
}

/// A booted runner, seen from the worker.
pub struct LaunchedRunner {
    pub transport: Transport,
    pub handle: RunnerHandle,
}

/// Starts the runner for one slot.
pub trait RunnerLauncher: Send + Sync {
    fn launch(&self, slot: usize) -> impl Future<Output = Result<LaunchedRunner, WorkerError>> + Send;
}

/// Spawns `fanout-wkr runner --slot N` child processes.
pub struct ProcessRunnerLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessRunnerLauncher {
    /// `args` are appended to every runner's command line (config path,
    /// verbosity, remote label).
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Launch runners from the running executable.
    pub fn current_exe(args: Vec<String>) -> Result<Self, WorkerError> {
        let program = std::env::current_exe().map_err(WorkerError::CurrentExe)?;
        Ok(Self::new(program, args))
    }

    pub fn command(&self, slot: usize) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("runner")
            .arg("--slot")
            .arg(slot.to_string())
            .args(&self.args);
        command
    }
}

impl RunnerLauncher for ProcessRunnerLauncher {
    async fn launch(&self, slot: usize) -> Result<LaunchedRunner, WorkerError> {
        let (transport, child) = spawn_local(self.command(slot), Role::Worker, format!("runner-{slot}"))
            .map_err(|source| WorkerError::Launch { slot, source })?;
        Ok(LaunchedRunner {
            transport,
            handle: RunnerHandle::Process(child),
        })
    }
}

/// Runs each slot's runner as a task in this process over an in-memory pair.
pub struct InProcessLauncher<E> {
    executor: Arc<E>,
}

impl<E: JobExecutor> InProcessLauncher<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }
}

impl<E: JobExecutor> RunnerLauncher for InProcessLauncher<E> {
    async fn launch(&self, slot: usize) -> Result<LaunchedRunner, WorkerError> {
        let (worker_end, runner_end) = Transport::pair(Role::Worker, Role::Runner, format!("runner-{slot}"));
        let runner = Runner::new(slot, runner_end, self.executor.clone());
        Ok(LaunchedRunner {
            transport: worker_end,
            handle: RunnerHandle::Task(tokio::spawn(runner.run())),
        })
    }
}

pub struct Worker<L> {
    upstream: Arc<Transport>,
    launcher: L,
    slots: usize,
    keepalive: Option<Duration>,
}

impl<L: RunnerLauncher> Worker<L> {
    /// `upstream` is the worker's end of its link to the coordinator.
    pub fn new(upstream: Transport, launcher: L, slots: usize) -> Self {
        Self {
            upstream: Arc::new(upstream),
            launcher,
            slots,
            keepalive: None,
        }
    }

    /// Ping the coordinator after this much silence.
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Boot the runners and relay until shutdown. Returns once every slot
    /// loop has finished and every runner has been reaped.
    pub async fn run(self) -> Result<(), WorkerError> {
        let mut transports = Vec::with_capacity(self.slots);
        let mut handles = Vec::with_capacity(self.slots);
        for slot in 0..self.slots {
            match self.launcher.launch(slot).await {
                Ok(launched) => {
                    transports.push(Arc::new(launched.transport));
                    handles.push(launched.handle);
                }
                Err(err) => {
                    warn!(slot, "Runner launch failed: {}", err);
                    shutdown_slots(&transports).await;
                    reap_all(handles).await;
                    let _ = self.upstream.close().await;
                    return Err(err);
                }
            }
        }
        info!(slots = self.slots, "Runners booted");

        let pool = Arc::new(SlotPool::new(self.slots));
        let stopping = CancellationToken::new();

        self.upstream.send(Message::WorkerReady).await?;

        let slot_loops: Vec<_> = transports
            .iter()
            .enumerate()
            .map(|(slot, transport)| {
                tokio::spawn(slot_loop(
                    slot,
                    transport.clone(),
                    self.upstream.clone(),
                    pool.clone(),
                    stopping.clone(),
                ))
            })
            .collect();

        self.from_master_loop(&transports, &pool, &stopping).await;

        stopping.cancel();
        shutdown_slots(&transports).await;
        let _ = self.upstream.close().await;

        for result in join_all(slot_loops).await {
            if let Err(err) = result {
                warn!("Slot loop failed: {}", err);
            }
        }
        reap_all(handles).await;
        info!("Worker stopped");
        Ok(())
    }

    async fn from_master_loop(&self, slots: &[Arc<Transport>], pool: &SlotPool, stopping: &CancellationToken) {
        loop {
            let received = match self.keepalive {
                Some(idle) => self.upstream.receive_within(idle).await,
                None => match self.upstream.receive().await {
                    Some(envelope) => Received::Message(envelope),
                    None => Received::Closed,
                },
            };

            let envelope = match received {
                Received::Message(envelope) => envelope,
                Received::Closed => {
                    if !stopping.is_cancelled() {
                        info!("Connection to master closed");
                    }
                    return;
                }
                Received::Idle => {
                    let _ = self.upstream.send(Message::Ping).await;
                    continue;
                }
            };

            if envelope.from != Role::Master {
                debug!(from = %envelope.from, kind = envelope.message.kind(), "Ignoring record not from master");
                continue;
            }

            match envelope.message {
                Message::RunJob { job } => {
                    let slot = tokio::select! {
                        _ = stopping.cancelled() => return,
                        slot = pool.acquire() => slot,
                    };
                    debug!(slot, job = %job, "Dispatching to runner");
                    if let Err(err) = slots[slot].send(Message::RunJob { job }).await {
                        warn!(slot, "Failed to hand job to runner: {}", err);
                    }
                }
                Message::Shutdown => {
                    info!("Shutdown requested by master");
                    return;
                }
                Message::Ping => {}
                other => debug!(kind = other.kind(), "Ignoring unexpected message from master"),
            }
        }
    }
}

async fn slot_loop(
    slot: usize,
    transport: Arc<Transport>,
    upstream: Arc<Transport>,
    pool: Arc<SlotPool>,
    stopping: CancellationToken,
) {
    loop {
        let Some(envelope) = transport.receive().await else {
            if !stopping.is_cancelled() {
                warn!(slot, "Lost runner, shutting worker down");
                stopping.cancel();
                let _ = upstream.close().await;
            }
            return;
        };

        if envelope.from != Role::Runner {
            debug!(slot, from = %envelope.from, "Ignoring record not from runner");
            continue;
        }

        let forward = match envelope.message {
            Message::RequestJob => {
                pool.release(slot);
                Message::RequestJob
            }
            Message::Result { job, output } => {
                pool.release(slot);
                Message::Result { job, output }
            }
            Message::Ping => continue,
            other => {
                debug!(slot, kind = other.kind(), "Ignoring unexpected message from runner");
                continue;
            }
        };

        if let Err(err) = upstream.send(forward).await {
            debug!(slot, "Could not forward upward: {}", err);
        }
    }
}

/// Forward `Shutdown` to every slot and close its transport.
async fn shutdown_slots(slots: &[Arc<Transport>]) {
    join_all(slots.iter().map(|transport| async move {
        let _ = transport.send(Message::Shutdown).await;
        let _ = transport.close().await;
    }))
    .await;
}

async fn reap_all(handles: Vec<RunnerHandle>) {
    join_all(
        handles
            .into_iter()
            .enumerate()
            .map(|(slot, handle)| handle.reap(slot)),
    )
    .await;
}
