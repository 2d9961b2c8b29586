//! fanout worker agent.
//!
//! A worker runs on each machine of the pool. It supervises one runner per
//! slot and relays jobs down and results up between the runners and the
//! coordinator. Runners execute one job at a time through a [`JobExecutor`].

pub mod executor;
pub mod runner;
pub mod runner_listener;
pub mod services;
pub mod worker;

pub use executor::{CommandExecutor, ExecutorError, FnExecutor, JobExecutor};
pub use runner::{Runner, RunnerExit};
pub use runner_listener::{RunnerListener, RunnerListenerRegistry, UnknownRunnerListener};
pub use services::{ServiceError, SlotServices};
pub use worker::{
    InProcessLauncher, LaunchedRunner, ProcessRunnerLauncher, RunnerHandle, RunnerLauncher, SlotPool,
    Worker, WorkerError,
};
