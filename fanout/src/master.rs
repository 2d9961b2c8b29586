//! The coordinator.
//!
//! The master owns the job queue and is the only component that decides
//! which job goes to which worker and when the run is over. Each worker
//! connection gets its own task that reacts to what the worker sends:
//!
//! - `RequestJob`: pop the next job (if any) and send it down;
//! - `Result`: requeue it if the output looks transient, otherwise record it
//!   and either send the next job or, once nothing is queued or in flight,
//!   start the shutdown cascade;
//! - end of stream: fatal unless the cascade is already running.
//!
//! Queue, in-flight set and failures sit behind one mutex, taken once per
//! message and never held across an `.await`.

use crate::history::{HistoryReport, sort_by_history};
use crate::launcher::{LaunchError, WorkerLauncher};
use crate::listener::{Listener, Listeners};
use fanout_common::{
    ConfigError, Message, PASS, RetryConfig, Role, Transport, WorkerKind, WorkerSpec,
};
use futures::future::join_all;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How long a worker process gets to exit after its connection closes.
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("No jobs to run")]
    NoJobs,

    #[error("Failed to boot worker {worker}: {source}")]
    Launch {
        worker: String,
        #[source]
        source: LaunchError,
    },

    #[error("Lost Worker [{worker}]")]
    ConnectionLost { worker: String },

    #[error("No worker could be booted")]
    NoWorkers,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MasterError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionLost { .. } | Self::NoWorkers | Self::Launch { .. } => 2,
            Self::NoJobs | Self::Config(_) => 1,
        }
    }
}

/// Decides which results are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    patterns: Vec<Regex>,
    max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            patterns: config.compile()?,
            max_retries: config.max_retries,
        })
    }

    /// Never retries.
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
            max_retries: None,
        }
    }

    pub fn is_transient(&self, output: &str) -> bool {
        output != PASS && self.patterns.iter().any(|p| p.is_match(output))
    }

    /// Whether a job already retried `retries` times may go again.
    fn allows(&self, retries: u32) -> bool {
        self.max_retries.is_none_or(|max| retries < max)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs whose terminal output was not a pass, in completion order.
    pub failed: Vec<String>,
    /// Terminal results recorded.
    pub results: usize,
    /// `RunJob` messages sent, retries included.
    pub dispatched: usize,
    /// Results requeued as transient.
    pub retried: usize,
    /// The run was cut short by a signal.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if self.interrupted { 1 } else { 0 }
    }

    pub fn passed(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<String>,
    /// Job id to number of outstanding dispatches.
    in_flight: HashMap<String, usize>,
    failed: Vec<String>,
    retries: HashMap<String, u32>,
    results: usize,
    dispatched: usize,
    retried: usize,
    shutting_down: bool,
    aborted: Option<MasterError>,
    /// Connections not known to have failed to boot.
    viable: usize,
}

impl DispatchState {
    fn in_flight_count(&self) -> usize {
        self.in_flight.values().sum()
    }

    fn take_in_flight(&mut self, job: &str) -> bool {
        match self.in_flight.get_mut(job) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.in_flight.remove(job);
                true
            }
            None => false,
        }
    }

    fn finished(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }
}

enum ResultAction {
    Retry,
    Recorded { last: bool },
    Unknown,
}

/// Per-connection slot the cascade and the booting task agree on.
#[derive(Default)]
struct ConnectionSlot {
    transport: Option<Arc<Transport>>,
    /// Set by the cascade or an abort; a late boot closes itself.
    ended: bool,
}

struct Connection {
    label: String,
    slot: Mutex<ConnectionSlot>,
}

impl Connection {
    /// Publish a booted transport. Returns false if the run already ended.
    fn attach(&self, transport: Arc<Transport>) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.ended {
            return false;
        }
        slot.transport = Some(transport);
        true
    }

    /// Forget a transport that never became a usable worker.
    fn detach(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.transport = None;
    }

    fn end(&self) -> Option<Arc<Transport>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.ended = true;
        slot.transport.clone()
    }
}

/// State shared by every connection task.
struct Hub {
    state: Mutex<DispatchState>,
    connections: Vec<Arc<Connection>>,
    listeners: Arc<Listeners>,
    retry: RetryPolicy,
    /// Cancelled when the cascade starts or the run aborts.
    stopping: CancellationToken,
    /// Cancelled once the cascade has finished or the run aborted.
    done: CancellationToken,
}

impl Hub {
    fn lock(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop the next job and send it down `transport`.
    async fn send_next(&self, transport: &Transport) {
        let (job, in_flight) = {
            let mut state = self.lock();
            if state.shutting_down || state.aborted.is_some() {
                return;
            }
            let Some(job) = state.queue.pop_front() else {
                return;
            };
            *state.in_flight.entry(job.clone()).or_insert(0) += 1;
            state.dispatched += 1;
            (job, state.in_flight_count())
        };

        self.listeners.job_begin(&job);
        debug!(worker = %transport.label(), job = %job, in_flight, "Dispatching");
        if let Err(err) = transport.send(Message::RunJob { job }).await {
            // The connection task sees the loss on its next receive.
            debug!(worker = %transport.label(), "Dispatch failed: {}", err);
        }
    }

    async fn handle_result(&self, transport: &Transport, job: String, output: String) {
        let transient = self.retry.is_transient(&output);
        let action = {
            let mut state = self.lock();
            if !state.take_in_flight(&job) {
                ResultAction::Unknown
            } else {
                let retries = state.retries.get(&job).copied().unwrap_or(0);
                if transient && self.retry.allows(retries) {
                    state.retries.insert(job.clone(), retries + 1);
                    state.retried += 1;
                    state.queue.push_back(job.clone());
                    ResultAction::Retry
                } else {
                    state.results += 1;
                    if output != PASS {
                        state.failed.push(job.clone());
                    }
                    let last = state.finished() && !state.shutting_down;
                    if last {
                        state.shutting_down = true;
                    }
                    ResultAction::Recorded { last }
                }
            }
        };

        match action {
            ResultAction::Retry => {
                info!(worker = %transport.label(), job = %job, "Transient failure, requeued");
                self.send_next(transport).await;
            }
            ResultAction::Recorded { last } => {
                self.listeners.job_end(&job, &output);
                if last {
                    info!("All jobs resolved");
                    self.cascade().await;
                } else {
                    self.send_next(transport).await;
                }
            }
            ResultAction::Unknown => {
                warn!(worker = %transport.label(), job = %job, "Result for a job that is not in flight");
                self.send_next(transport).await;
            }
        }
    }

    /// Mark the run as shutting down. Returns false if it already was.
    fn begin_shutdown(&self) -> bool {
        let mut state = self.lock();
        if state.shutting_down || state.aborted.is_some() {
            return false;
        }
        state.shutting_down = true;
        true
    }

    /// Send `Shutdown` to every worker concurrently, close every
    /// connection and notify listeners. Callers flip `shutting_down` first,
    /// so this runs once.
    async fn cascade(&self) {
        self.stopping.cancel();
        let live: Vec<_> = self
            .connections
            .iter()
            .filter_map(|conn| conn.end().map(|t| (conn.label.clone(), t)))
            .collect();
        info!(workers = live.len(), "Shutting down workers");

        join_all(live.into_iter().map(|(label, transport)| async move {
            let _ = transport.send(Message::Shutdown).await;
            if let Err(err) = transport.close().await {
                debug!(worker = %label, "Close failed: {}", err);
            }
            self.listeners.worker_end(&label);
        }))
        .await;
        self.done.cancel();
    }

    /// End the run with `err` unless it is already ending. Loss of a
    /// connection during the cascade is expected and ignored here.
    async fn abort(&self, err: MasterError) {
        {
            let mut state = self.lock();
            if state.shutting_down || state.aborted.is_some() {
                debug!("Ignoring {} during shutdown", err);
                return;
            }
            error!("{}", err);
            state.aborted = Some(err);
        }
        self.stopping.cancel();
        let live: Vec<_> = self.connections.iter().filter_map(|conn| conn.end()).collect();
        join_all(live.iter().map(|transport| transport.close())).await;
        self.done.cancel();
    }

    /// A connection failed to boot; abort if it was the last one standing.
    async fn boot_failed(&self, label: &str, err: LaunchError) {
        error!(worker = %label, "Worker boot failed: {}", err);
        let none_left = {
            let mut state = self.lock();
            state.viable = state.viable.saturating_sub(1);
            state.viable == 0
        };
        if none_left {
            self.abort(MasterError::NoWorkers).await;
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

/// How a connection task gets its transport.
enum Boot {
    Ready {
        transport: Arc<Transport>,
        child: Option<Child>,
    },
    Deferred(WorkerSpec),
}

/// Coordinates one run over a set of workers.
pub struct Master<L> {
    jobs: Vec<String>,
    workers: Vec<WorkerSpec>,
    launcher: Arc<L>,
    listeners: Listeners,
    retry: RetryPolicy,
    history: Option<HistoryReport>,
    interrupt: CancellationToken,
}

impl<L: WorkerLauncher> Master<L> {
    pub fn new(jobs: Vec<String>, workers: Vec<WorkerSpec>, launcher: L) -> Self {
        Self {
            jobs,
            workers,
            launcher: Arc::new(launcher),
            listeners: Listeners::default(),
            retry: RetryPolicy::none(),
            history: None,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Order the queue longest-first using `history`.
    pub fn with_history(mut self, history: Option<HistoryReport>) -> Self {
        self.history = history;
        self
    }

    /// Token whose cancellation interrupts the run.
    pub fn with_interrupt(mut self, interrupt: CancellationToken) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub async fn run(self) -> Result<RunSummary, MasterError> {
        if self.jobs.is_empty() {
            return Err(MasterError::NoJobs);
        }
        if self.workers.is_empty() {
            return Err(MasterError::NoWorkers);
        }

        let jobs = match &self.history {
            Some(history) => sort_by_history(self.jobs, history),
            None => self.jobs,
        };
        info!(jobs = jobs.len(), workers = self.workers.len(), "Starting run");

        let connections: Vec<_> = self
            .workers
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                Arc::new(Connection {
                    label: spec.label(index),
                    slot: Mutex::new(ConnectionSlot::default()),
                })
            })
            .collect();

        let listeners = Arc::new(self.listeners);
        let hub = Arc::new(Hub {
            state: Mutex::new(DispatchState {
                queue: jobs.iter().cloned().collect(),
                viable: connections.len(),
                ..DispatchState::default()
            }),
            connections: connections.clone(),
            listeners: listeners.clone(),
            retry: self.retry,
            stopping: CancellationToken::new(),
            done: CancellationToken::new(),
        });

        listeners.testing_begin(&jobs);

        // Local workers boot up front; remote boots happen in their tasks.
        let mut boots = Vec::with_capacity(self.workers.len());
        for (index, spec) in self.workers.iter().enumerate() {
            if spec.kind == WorkerKind::Remote {
                boots.push(Boot::Deferred(spec.clone()));
                continue;
            }
            match self.launcher.launch(spec, index).await {
                Ok(launched) => {
                    let transport = Arc::new(launched.transport);
                    connections[index].attach(transport.clone());
                    boots.push(Boot::Ready {
                        transport,
                        child: launched.child,
                    });
                }
                Err(source) => {
                    let err = MasterError::Launch {
                        worker: connections[index].label.clone(),
                        source,
                    };
                    let mut children = Vec::new();
                    for boot in boots {
                        if let Boot::Ready { transport, child } = boot {
                            let _ = transport.close().await;
                            children.extend(child);
                        }
                    }
                    reap(children).await;
                    return Err(err);
                }
            }
        }

        let tasks: Vec<_> = boots
            .into_iter()
            .enumerate()
            .map(|(index, boot)| {
                tokio::spawn(serve_connection(
                    hub.clone(),
                    connections[index].clone(),
                    self.launcher.clone(),
                    index,
                    boot,
                ))
            })
            .collect();

        let mut interrupt_seen = false;
        let mut interrupted = false;
        loop {
            tokio::select! {
                _ = hub.done.cancelled() => break,
                _ = self.interrupt.cancelled(), if !interrupt_seen => {
                    interrupt_seen = true;
                    // Too late to matter if the run is already winding down.
                    if hub.begin_shutdown() {
                        interrupted = true;
                        warn!("Interrupted, shutting down");
                        hub.cascade().await;
                    }
                }
            }
        }

        let mut children = Vec::new();
        for task in join_all(tasks).await {
            match task {
                Ok(child) => children.extend(child),
                Err(err) => warn!("Connection task failed: {}", err),
            }
        }
        reap(children).await;

        let mut state = hub.lock();
        if let Some(err) = state.aborted.take() {
            return Err(err);
        }
        let summary = RunSummary {
            failed: std::mem::take(&mut state.failed),
            results: state.results,
            dispatched: state.dispatched,
            retried: state.retried,
            interrupted,
        };
        drop(state);

        listeners.testing_end();
        info!(
            results = summary.results,
            failed = summary.failed.len(),
            retried = summary.retried,
            "Run finished"
        );
        Ok(summary)
    }
}

/// One connection's lifetime: boot if deferred, then react to the worker
/// until the stream ends. Returns the process to reap.
async fn serve_connection<L: WorkerLauncher>(
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    launcher: Arc<L>,
    index: usize,
    boot: Boot,
) -> Option<Child> {
    let deferred = matches!(boot, Boot::Deferred(_));
    let (transport, child) = match boot {
        Boot::Ready { transport, child } => (transport, child),
        Boot::Deferred(spec) => {
            let result = tokio::select! {
                _ = hub.stopping.cancelled() => return None,
                result = launcher.launch(&spec, index) => result,
            };
            let launched = match result {
                Ok(launched) => launched,
                Err(err) => {
                    hub.boot_failed(&conn.label, err).await;
                    return None;
                }
            };
            let transport = Arc::new(launched.transport);
            if !conn.attach(transport.clone()) {
                let _ = transport.close().await;
                return launched.child;
            }
            (transport, launched.child)
        }
    };

    // A remote session can spawn fine and still never reach the worker
    // (unreachable host, failed bootstrap); that only shows up as EOF.
    let mut ready = false;
    loop {
        let Some(envelope) = transport.receive().await else {
            if hub.is_shutting_down() {
                debug!(worker = %conn.label, "Connection closed");
            } else if deferred && !ready {
                conn.detach();
                let _ = transport.close().await;
                hub.boot_failed(&conn.label, LaunchError::NotReady(conn.label.clone()))
                    .await;
            } else {
                hub.abort(MasterError::ConnectionLost {
                    worker: conn.label.clone(),
                })
                .await;
            }
            break;
        };

        if envelope.from != Role::Worker {
            trace!(worker = %conn.label, from = %envelope.from, "Ignoring echoed record");
            continue;
        }

        match envelope.message {
            Message::WorkerReady => {
                ready = true;
                info!(worker = %conn.label, "Worker ready");
                hub.listeners.worker_begin(&conn.label);
            }
            Message::RequestJob => hub.send_next(&transport).await,
            Message::Result { job, output } => hub.handle_result(&transport, job, output).await,
            Message::Ping => trace!(worker = %conn.label, "Ping"),
            other => debug!(worker = %conn.label, kind = other.kind(), "Ignoring unexpected message"),
        }
    }

    child
}

/// Wait for worker processes, killing any that outlive the timeout.
async fn reap(children: Vec<Child>) {
    join_all(children.into_iter().map(|mut child| async move {
        match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Worker exited"),
            Ok(Err(err)) => warn!("Failed to wait for worker: {}", err),
            Err(_) => {
                warn!(pid = ?child.id(), "Worker did not exit, killing it");
                let _ = child.kill().await;
            }
        }
    }))
    .await;
}
