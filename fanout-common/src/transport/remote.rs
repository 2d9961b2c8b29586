//! Remote-shell backed transport.
//!
//! Opens `ssh -tt` to the target, walks a short bootstrap (create and enter
//! the working directory, then exec the worker launch command) and from then
//! on treats the session's stdio as the message channel. The pseudo-terminal
//! echoes everything we write, which is why receivers filter on sender role.

use super::{Transport, TransportError};
use crate::protocol::Role;
use shell_escape::unix::escape;
use std::borrow::Cow;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Where and how to reach a remote worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Connection target passed to ssh, e.g. `deploy@ci-box-3`.
    pub target: String,
    /// Extra ssh options, e.g. `-p 3022 -i ~/.ssh/ci`.
    pub ssh_opts: Vec<String>,
    /// Working directory on the remote host.
    pub directory: String,
}

impl RemoteTarget {
    pub fn new(target: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ssh_opts: Vec::new(),
            directory: directory.into(),
        }
    }

    /// Parse whitespace-separated ssh options.
    pub fn with_ssh_opts(mut self, opts: &str) -> Self {
        self.ssh_opts = opts.split_whitespace().map(str::to_string).collect();
        self
    }
}

/// Lines written into the remote shell before the launch command takes over.
pub fn bootstrap_script(directory: &str, command: &str) -> Vec<String> {
    let dir = escape(Cow::Borrowed(directory));
    vec![
        "echo connected".to_string(),
        format!("mkdir -p {dir}"),
        "echo mkdired".to_string(),
        format!("cd {dir}"),
        "echo cded".to_string(),
        command.to_string(),
    ]
}

/// Factory for ssh-backed transports.
pub struct RemoteSession;

impl RemoteSession {
    /// Open a session and run the bootstrap. The returned transport writes
    /// `exit` to the shell when closed.
    pub async fn open(
        target: &RemoteTarget,
        command: &str,
        role: Role,
    ) -> Result<(Transport, Child), TransportError> {
        let mut ssh = Command::new("ssh");
        ssh.arg("-tt")
            .args(&target.ssh_opts)
            .arg(&target.target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!(target = %target.target, directory = %target.directory, "Opening remote session");
        let mut child = ssh.spawn().map_err(|source| TransportError::Spawn {
            program: "ssh".to_string(),
            source,
        })?;

        let transport =
            Transport::from_child(&mut child, role, target.target.clone())?.with_farewell("exit");

        for line in bootstrap_script(&target.directory, command) {
            debug!(target = %target.target, "bootstrap: {}", line);
            transport.send_raw(&line).await?;
        }

        Ok((transport, child))
    }
}
