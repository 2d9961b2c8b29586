//! The leaf of the dispatch tree: one runner per slot, one job at a time.
//!
//! ```text
//! Booting --RequestJob--> Idle --RunJob--> Executing --Result--> Idle
//!                          |
//!                          +--Shutdown / worker lost--> Stopped
//! ```

use crate::executor::JobExecutor;
use crate::runner_listener::RunnerListener;
use crate::services::SlotServices;
use fanout_common::transport::Received;
use fanout_common::{Message, PASS, Role, Transport};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a runner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    /// The worker asked it to.
    Shutdown,
    /// The worker went away.
    WorkerLost,
}

pub struct Runner<E> {
    slot: usize,
    transport: Transport,
    executor: E,
    services: SlotServices,
    listeners: Vec<Box<dyn RunnerListener>>,
    keepalive: Option<Duration>,
}

impl<E: JobExecutor> Runner<E> {
    /// `transport` is the runner's end of its link to the worker.
    pub fn new(slot: usize, transport: Transport, executor: E) -> Self {
        Self {
            slot,
            transport,
            executor,
            services: SlotServices::default(),
            listeners: Vec::new(),
            keepalive: None,
        }
    }

    /// Services started for this slot; stopped when the runner stops.
    pub fn with_services(mut self, services: SlotServices) -> Self {
        self.services = services;
        self
    }

    pub fn with_listeners(mut self, listeners: Vec<Box<dyn RunnerListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Ping the worker after this much silence.
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub async fn run(mut self) -> RunnerExit {
        for listener in &self.listeners {
            listener.runner_begin(self.slot);
        }

        let exit = self.message_loop().await;

        self.services.stop().await;
        let _ = self.transport.close().await;
        for listener in &self.listeners {
            listener.runner_end(self.slot);
        }
        info!(slot = self.slot, ?exit, "Runner stopped");
        exit
    }

    async fn message_loop(&self) -> RunnerExit {
        if self.transport.send(Message::RequestJob).await.is_err() {
            return RunnerExit::WorkerLost;
        }

        loop {
            let received = match self.keepalive {
                Some(idle) => self.transport.receive_within(idle).await,
                None => match self.transport.receive().await {
                    Some(envelope) => Received::Message(envelope),
                    None => Received::Closed,
                },
            };

            let envelope = match received {
                Received::Message(envelope) => envelope,
                Received::Closed => {
                    warn!(slot = self.slot, "Lost connection to worker");
                    return RunnerExit::WorkerLost;
                }
                Received::Idle => {
                    if self.ping().await.is_err() {
                        return RunnerExit::WorkerLost;
                    }
                    continue;
                }
            };

            match (envelope.from, envelope.message) {
                (Role::Worker, Message::RunJob { job }) => {
                    let output = self.run_job(&job).await;
                    // The link may have dropped while the job ran; the result
                    // is lost but the runner only notices now.
                    if let Err(err) = self.transport.send(Message::Result { job, output }).await {
                        warn!(slot = self.slot, "Could not report result: {}", err);
                        return RunnerExit::WorkerLost;
                    }
                }
                (Role::Worker, Message::Shutdown) => {
                    debug!(slot = self.slot, "Shutdown requested");
                    return RunnerExit::Shutdown;
                }
                (from, message) => {
                    debug!(slot = self.slot, %from, kind = message.kind(), "Unexpected message");
                    if self.ping().await.is_err() {
                        return RunnerExit::WorkerLost;
                    }
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), fanout_common::TransportError> {
        self.transport.send(Message::Ping).await
    }

    /// Execute `job`, folding executor errors and panics into failure output.
    async fn run_job(&self, job: &str) -> String {
        debug!(slot = self.slot, job, "Running job");
        let outcome = AssertUnwindSafe(self.executor.execute(job)).catch_unwind().await;
        match outcome {
            Ok(Ok(output)) => normalize_output(output),
            Ok(Err(err)) => format!("FAILURE: {job}: {err}"),
            Err(panic) => format!("FAILURE: {job}: job executor panicked: {}", panic_message(&*panic)),
        }
    }
}

/// Empty output counts as a pass.
pub fn normalize_output(output: String) -> String {
    if output.trim().is_empty() {
        PASS.to_string()
    } else {
        output
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, FnExecutor};
    use crate::runner_listener::RunnerListener;
    use fanout_common::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn spawn_runner<E: JobExecutor>(executor: E) -> (Transport, tokio::task::JoinHandle<RunnerExit>) {
        let (worker, runner) = Transport::pair(Role::Worker, Role::Runner, "slot-0");
        let handle = tokio::spawn(Runner::new(0, runner, executor).run());
        (worker, handle)
    }

    async fn expect(worker: &Transport, message: Message) {
        assert_eq!(worker.receive().await, Some(Envelope::new(Role::Runner, message)));
    }

    async fn run(worker: &Transport, job: &str) -> String {
        worker
            .send(Message::RunJob { job: job.to_string() })
            .await
            .unwrap();
        match worker.receive().await.unwrap().message {
            Message::Result { job: got, output } => {
                assert_eq!(got, job);
                output
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_requests_job_then_reports_results() {
        let executor = FnExecutor::new(|job: String| async move {
            Ok::<_, ExecutorError>(if job == "bad" { "boom".to_string() } else { PASS.to_string() })
        });
        let (worker, handle) = spawn_runner(executor);

        expect(&worker, Message::RequestJob).await;
        assert_eq!(run(&worker, "good").await, PASS);
        assert_eq!(run(&worker, "bad").await, "boom");

        worker.send(Message::Shutdown).await.unwrap();
        assert_eq!(handle.await.unwrap(), RunnerExit::Shutdown);
    }

    #[tokio::test]
    async fn test_empty_output_is_a_pass() {
        let executor = FnExecutor::new(|_job: String| async { Ok::<_, ExecutorError>(String::new()) });
        let (worker, _handle) = spawn_runner(executor);
        expect(&worker, Message::RequestJob).await;
        assert_eq!(run(&worker, "x").await, PASS);
    }

    #[tokio::test]
    async fn test_executor_error_becomes_failure_output() {
        let executor = FnExecutor::new(|_job: String| async {
            Err::<String, _>(ExecutorError::Failed("database unreachable".to_string()))
        });
        let (worker, handle) = spawn_runner(executor);
        expect(&worker, Message::RequestJob).await;

        let output = run(&worker, "x").await;
        assert!(output.starts_with("FAILURE: x:"));
        assert!(output.contains("database unreachable"));

        worker.send(Message::Shutdown).await.unwrap();
        assert_eq!(handle.await.unwrap(), RunnerExit::Shutdown);
    }

    #[tokio::test]
    async fn test_executor_panic_does_not_kill_slot() {
        let executor = FnExecutor::new(|job: String| async move {
            if job == "explode" {
                panic!("kaboom");
            }
            Ok::<_, ExecutorError>(PASS.to_string())
        });
        let (worker, handle) = spawn_runner(executor);
        expect(&worker, Message::RequestJob).await;

        let output = run(&worker, "explode").await;
        assert!(output.contains("panicked"));
        assert!(output.contains("kaboom"));
        assert_eq!(run(&worker, "after").await, PASS);

        worker.send(Message::Shutdown).await.unwrap();
        assert_eq!(handle.await.unwrap(), RunnerExit::Shutdown);
    }

    #[tokio::test]
    async fn test_unexpected_message_gets_ping() {
        let executor = FnExecutor::new(|_job: String| async { Ok::<_, ExecutorError>(PASS.to_string()) });
        let (worker, _handle) = spawn_runner(executor);
        expect(&worker, Message::RequestJob).await;

        worker.send(Message::WorkerReady).await.unwrap();
        expect(&worker, Message::Ping).await;
    }

    #[tokio::test]
    async fn test_keepalive_pings_when_idle() {
        let (worker, runner) = Transport::pair(Role::Worker, Role::Runner, "slot-0");
        let executor = FnExecutor::new(|_job: String| async { Ok::<_, ExecutorError>(PASS.to_string()) });
        let _handle = tokio::spawn(
            Runner::new(0, runner, executor)
                .with_keepalive(Some(Duration::from_millis(20)))
                .run(),
        );

        expect(&worker, Message::RequestJob).await;
        expect(&worker, Message::Ping).await;
    }

    #[tokio::test]
    async fn test_worker_loss_while_idle_stops_runner() {
        let executor = FnExecutor::new(|_job: String| async { Ok::<_, ExecutorError>(PASS.to_string()) });
        let (worker, handle) = spawn_runner(executor);
        expect(&worker, Message::RequestJob).await;

        drop(worker);
        assert_eq!(handle.await.unwrap(), RunnerExit::WorkerLost);
    }

    struct Counting(Arc<AtomicUsize>);

    impl RunnerListener for Counting {
        fn runner_begin(&self, _slot: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn runner_end(&self, _slot: usize) {
            self.0.fetch_add(10, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_listeners_see_begin_and_end() {
        let count = Arc::new(AtomicUsize::new(0));
        let (worker, runner) = Transport::pair(Role::Worker, Role::Runner, "slot-0");
        let executor = FnExecutor::new(|_job: String| async { Ok::<_, ExecutorError>(PASS.to_string()) });
        let handle = tokio::spawn(
            Runner::new(0, runner, executor)
                .with_listeners(vec![Box::new(Counting(count.clone()))])
                .run(),
        );

        expect(&worker, Message::RequestJob).await;
        worker.send(Message::Shutdown).await.unwrap();
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output(String::new()), PASS);
        assert_eq!(normalize_output("  \n".to_string()), PASS);
        assert_eq!(normalize_output("F".to_string()), "F");
    }
}
