//! Booting workers.
//!
//! Local workers are child processes with piped stdio. Remote workers are
//! reached over `ssh -tt`, optionally after syncing the tree onto the host.

use crate::sync::{RemoteSync, SyncError};
use fanout_common::transport::spawn_local;
use fanout_common::{
    RemoteSession, Role, RunConfig, SyncConfig, Transport, TransportError, WorkerKind, WorkerSpec,
};
use shell_escape::unix::escape;
use std::borrow::Cow;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::info;

/// Worker binary name looked up on `PATH`.
pub const WORKER_BIN: &str = "fanout-wkr";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("Worker {0} is remote but has no target or directory")]
    MissingTarget(String),

    #[error("Worker {0} closed the connection before reporting ready")]
    NotReady(String),
}

/// A worker that has been started, seen from the coordinator.
pub struct Launched {
    pub transport: Transport,
    /// Local process (or ssh client) to reap after shutdown.
    pub child: Option<Child>,
}

/// Starts workers described by [`WorkerSpec`]s.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(
        &self,
        spec: &WorkerSpec,
        index: usize,
    ) -> impl Future<Output = Result<Launched, LaunchError>> + Send;
}

/// Launches real `fanout-wkr` processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    local_bin: PathBuf,
    remote_bin: String,
    config_path: Option<PathBuf>,
    environment: String,
    verbose: bool,
    sync: Option<SyncConfig>,
}

impl ProcessLauncher {
    pub fn from_config(config: &RunConfig, config_path: Option<PathBuf>) -> Self {
        let local_bin = config
            .worker_bin
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(sibling_worker_bin);
        Self {
            local_bin,
            remote_bin: config.worker_bin.clone().unwrap_or_else(|| WORKER_BIN.to_string()),
            config_path,
            environment: config.environment.clone(),
            verbose: config.verbose,
            sync: config.sync.clone(),
        }
    }

    pub fn local_command(&self, spec: &WorkerSpec) -> Command {
        let mut command = Command::new(&self.local_bin);
        command.args(self.worker_args(spec, None));
        command
    }

    /// The shell line that starts a remote worker; `exit` closes the session
    /// once the worker returns.
    pub fn remote_command(&self, spec: &WorkerSpec, target: &str) -> String {
        if let Some(command) = &spec.command {
            return command.clone();
        }
        let args: Vec<String> = self
            .worker_args(spec, Some(target))
            .into_iter()
            .map(|arg| escape(Cow::Owned(arg)).into_owned())
            .collect();
        format!(
            "FANOUT_ENV={} {} {}; exit",
            escape(Cow::Borrowed(&self.environment)),
            self.remote_bin,
            args.join(" ")
        )
    }

    fn worker_args(&self, spec: &WorkerSpec, remote: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--slots".to_string(),
            spec.slots.to_string(),
        ];
        if let Some(remote) = remote {
            args.push("--remote".to_string());
            args.push(remote.to_string());
        }
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args
    }
}

impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec, index: usize) -> Result<Launched, LaunchError> {
        let label = spec.label(index);
        match spec.kind {
            WorkerKind::Local => {
                info!(worker = %label, slots = spec.slots, "Booting local worker");
                let (transport, child) = spawn_local(self.local_command(spec), Role::Master, label)?;
                Ok(Launched {
                    transport,
                    child: Some(child),
                })
            }
            WorkerKind::Remote => {
                let target = spec
                    .remote_target()
                    .ok_or_else(|| LaunchError::MissingTarget(label.clone()))?;
                if let Some(sync) = &self.sync {
                    RemoteSync::new(target.clone(), sync.clone()).run().await?;
                }
                info!(worker = %label, slots = spec.slots, "Booting remote worker");
                let command = self.remote_command(spec, &target.target);
                let (transport, child) = RemoteSession::open(&target, &command, Role::Master).await?;
                Ok(Launched {
                    transport,
                    child: Some(child),
                })
            }
        }
    }
}

/// `fanout-wkr` next to the running executable, else the bare name.
fn sibling_worker_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BIN)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(WORKER_BIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher(config_path: Option<&str>) -> ProcessLauncher {
        let mut config = RunConfig::default();
        config.worker_bin = Some("/opt/fanout/bin/fanout-wkr".to_string());
        config.environment = "ci".to_string();
        ProcessLauncher::from_config(&config, config_path.map(PathBuf::from))
    }

    #[test]
    fn test_local_command_line() {
        let command = launcher(Some("fanout.toml")).local_command(&WorkerSpec::local(4));
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(command.as_std().get_program(), "/opt/fanout/bin/fanout-wkr");
        assert_eq!(args, vec!["worker", "--slots", "4", "--config", "fanout.toml"]);
    }

    #[test]
    fn test_default_remote_command() {
        let spec = WorkerSpec::remote("ci@box", "/srv/app", 8);
        assert_eq!(
            launcher(None).remote_command(&spec, "ci@box"),
            "FANOUT_ENV=ci /opt/fanout/bin/fanout-wkr worker --slots 8 --remote 'ci@box'; exit"
        );
    }

    #[test]
    fn test_remote_command_override() {
        let mut spec = WorkerSpec::remote("ci@box", "/srv/app", 8);
        spec.command = Some("bin/start-worker 8; exit".to_string());
        assert_eq!(launcher(None).remote_command(&spec, "ci@box"), "bin/start-worker 8; exit");
    }

    #[tokio::test]
    async fn test_remote_without_target_fails() {
        let spec = WorkerSpec {
            kind: WorkerKind::Remote,
            ..WorkerSpec::local(1)
        };
        let err = launcher(None).launch(&spec, 0).await.err().unwrap();
        assert!(matches!(err, LaunchError::MissingTarget(_)));
    }
}
