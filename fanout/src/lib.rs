//! fanout coordinator.
//!
//! The coordinator boots a pool of workers, hands out jobs longest-first,
//! retries transient failures and shuts the pool down once every job has a
//! result. Progress is reported through [`Listener`]s.

pub mod history;
pub mod launcher;
pub mod listener;
pub mod listeners;
pub mod master;
pub mod signals;
pub mod sync;

pub use history::{HistoryError, HistoryReport, JobTiming, sort_by_history};
pub use launcher::{LaunchError, Launched, ProcessLauncher, WorkerLauncher};
pub use listener::{Listener, ListenerContext, ListenerRegistry, Listeners, UnknownListener};
pub use master::{Master, MasterError, RetryPolicy, RunSummary};
pub use signals::{SignalError, install_interrupt_handler};
pub use sync::{RemoteSync, SyncError, remote_syncs, sync_all};
