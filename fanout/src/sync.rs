//! Staging the local tree onto remote workers with rsync over ssh.

use fanout_common::{RemoteTarget, RunConfig, SyncConfig};
use futures::future::join_all;
use shell_escape::unix::escape;
use std::borrow::Cow;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} for {target} failed ({status}): {stderr}")]
    Failed {
        step: &'static str,
        target: String,
        status: String,
        stderr: String,
    },
}

/// One remote host's sync job.
#[derive(Debug, Clone)]
pub struct RemoteSync {
    target: RemoteTarget,
    config: SyncConfig,
}

impl RemoteSync {
    pub fn new(target: RemoteTarget, config: SyncConfig) -> Self {
        Self { target, config }
    }

    pub fn target(&self) -> &str {
        &self.target.target
    }

    /// `ssh <opts> <target> mkdir -p <dir>`
    pub fn mkdir_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .args(&self.target.ssh_opts)
            .arg(&self.target.target)
            .arg(format!("mkdir -p {}", escape(Cow::Borrowed(&self.target.directory))));
        command
    }

    /// `rsync -avz --delete [--exclude=..] -e "ssh <opts>" <src> <dst>`
    pub fn rsync_command(&self) -> Command {
        let local = format!("{}/", self.config.directory.display().to_string().trim_end_matches('/'));
        let remote = format!(
            "{}:{}/",
            self.target.target,
            self.target.directory.trim_end_matches('/')
        );
        let (source, destination) = if self.config.reverse_sync_direction {
            (remote, local)
        } else {
            (local, remote)
        };

        let mut shell = vec!["ssh".to_string()];
        shell.extend(self.target.ssh_opts.iter().cloned());

        let mut command = Command::new("rsync");
        command.arg("-avz").arg("--delete");
        for exclude in &self.config.exclude {
            command.arg(format!("--exclude={exclude}"));
        }
        command
            .arg("-e")
            .arg(shell.join(" "))
            .args(self.config.rsync_opts.split_whitespace())
            .arg(source)
            .arg(destination);
        command
    }

    pub async fn run(&self) -> Result<(), SyncError> {
        info!(target = %self.target.target, directory = %self.target.directory, "Syncing");
        run_step("mkdir", self.target(), self.mkdir_command()).await?;
        run_step("rsync", self.target(), self.rsync_command()).await?;
        debug!(target = %self.target.target, "Sync complete");
        Ok(())
    }
}

async fn run_step(step: &'static str, target: &str, mut command: Command) -> Result<(), SyncError> {
    let program = command.as_std().get_program().to_string_lossy().to_string();
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| SyncError::Spawn { program, source })?;

    if output.status.success() {
        return Ok(());
    }
    Err(SyncError::Failed {
        step,
        target: target.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Sync jobs for every remote worker, when `[sync]` is configured.
pub fn remote_syncs(config: &RunConfig) -> Vec<RemoteSync> {
    let Some(sync) = &config.sync else {
        return Vec::new();
    };
    config
        .remote_workers()
        .filter_map(|worker| worker.remote_target())
        .map(|target| RemoteSync::new(target, sync.clone()))
        .collect()
}

/// Run all syncs concurrently, reporting each outcome by target.
pub async fn sync_all(syncs: &[RemoteSync]) -> Vec<(String, Result<(), SyncError>)> {
    join_all(
        syncs
            .iter()
            .map(|sync| async move { (sync.target().to_string(), sync.run().await) }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_common::WorkerSpec;
    use std::path::PathBuf;

    fn args(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    fn sync_config(reverse: bool) -> SyncConfig {
        SyncConfig {
            directory: PathBuf::from("/home/dev/app/"),
            exclude: vec!["tmp".to_string(), "log".to_string()],
            rsync_opts: "--compress-level=9".to_string(),
            reverse_sync_direction: reverse,
        }
    }

    fn target() -> RemoteTarget {
        RemoteTarget::new("ci@box", "/srv/app").with_ssh_opts("-p 3022")
    }

    #[test]
    fn test_rsync_arguments() {
        let sync = RemoteSync::new(target(), sync_config(false));
        assert_eq!(
            args(&sync.rsync_command()),
            vec![
                "-avz",
                "--delete",
                "--exclude=tmp",
                "--exclude=log",
                "-e",
                "ssh -p 3022",
                "--compress-level=9",
                "/home/dev/app/",
                "ci@box:/srv/app/",
            ]
        );
    }

    #[test]
    fn test_reverse_direction_swaps_endpoints() {
        let sync = RemoteSync::new(target(), sync_config(true));
        let args = args(&sync.rsync_command());
        assert_eq!(&args[args.len() - 2..], ["ci@box:/srv/app/", "/home/dev/app/"]);
    }

    #[test]
    fn test_mkdir_runs_on_target() {
        let sync = RemoteSync::new(target(), sync_config(false));
        assert_eq!(
            args(&sync.mkdir_command()),
            vec!["-p", "3022", "ci@box", "mkdir -p /srv/app"]
        );
    }

    #[test]
    fn test_only_remote_workers_are_synced() {
        let mut config = RunConfig::default();
        config.workers = vec![WorkerSpec::local(2), WorkerSpec::remote("ci@box", "/srv/app", 4)];
        assert!(remote_syncs(&config).is_empty());

        config.sync = Some(sync_config(false));
        let syncs = remote_syncs(&config);
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].target(), "ci@box");
    }
}
