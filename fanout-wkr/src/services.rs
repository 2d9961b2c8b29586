//! Per-slot dependent services.
//!
//! Each runner may start background processes its jobs need (a cache, a
//! database) on a port private to its slot, so parallel slots on one host
//! never share state. Services live exactly as long as the runner.

use fanout_common::ServiceSpec;
use std::fs::OpenOptions;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Ports handed out to slot services.
pub const PORT_RANGE: Range<u16> = 10000..30000;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Failed to open log {path} for service {name}: {source}")]
    Log {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start service {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn pick_port() -> u16 {
    fastrand::u16(PORT_RANGE)
}

/// Expand `{port}` and `{slot}` in a service command.
pub fn render_command(template: &str, port: u16, slot: usize) -> String {
    template
        .replace("{port}", &port.to_string())
        .replace("{slot}", &slot.to_string())
}

struct RunningService {
    name: String,
    port: u16,
    port_env: Option<String>,
    child: Child,
}

/// The services started for one slot.
#[derive(Default)]
pub struct SlotServices {
    slot: usize,
    running: Vec<RunningService>,
}

impl SlotServices {
    /// Start every service in `specs`, logging each to
    /// `<log_dir>/<name>_<slot>.log`. Already-started services are stopped
    /// if a later one fails.
    pub async fn start(specs: &[ServiceSpec], slot: usize, log_dir: &Path) -> Result<Self, ServiceError> {
        let mut services = Self {
            slot,
            running: Vec::new(),
        };
        for spec in specs {
            match spawn_service(spec, slot, log_dir) {
                Ok(service) => services.running.push(service),
                Err(err) => {
                    services.stop().await;
                    return Err(err);
                }
            }
        }
        Ok(services)
    }

    /// Environment entries exporting service ports to jobs.
    pub fn env(&self) -> Vec<(String, String)> {
        self.running
            .iter()
            .filter_map(|s| s.port_env.as_ref().map(|var| (var.clone(), s.port.to_string())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Kill and reap every service.
    pub async fn stop(&mut self) {
        for mut service in self.running.drain(..) {
            let group_killed = match service.child.id() {
                Some(pid) => kill_group(pid).await,
                None => false,
            };
            if !group_killed && let Err(err) = service.child.start_kill() {
                debug!(service = %service.name, "Kill failed (already exited?): {}", err);
            }
            match tokio::time::timeout(STOP_TIMEOUT, service.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(service = %service.name, slot = self.slot, %status, "Service stopped")
                }
                Ok(Err(err)) => warn!(service = %service.name, "Failed to reap service: {}", err),
                Err(_) => warn!(service = %service.name, "Service did not exit after kill"),
            }
        }
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
async fn kill_group(pid: u32) -> bool {
    match Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(err) => {
            debug!(pid, "Failed to run kill: {}", err);
            false
        }
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: u32) -> bool {
    false
}

fn spawn_service(spec: &ServiceSpec, slot: usize, log_dir: &Path) -> Result<RunningService, ServiceError> {
    let port = pick_port();
    let command = render_command(&spec.command, port, slot);
    let path = log_dir.join(format!("{}_{}.log", spec.name, slot));

    let log_error = |source| ServiceError::Log {
        name: spec.name.clone(),
        path: path.clone(),
        source,
    };
    std::fs::create_dir_all(log_dir).map_err(log_error)?;
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(log_error)?;
    let stderr = stdout.try_clone().map_err(log_error)?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);
    // Own group, so stop() reaches whatever the shell started.
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|source| ServiceError::Spawn {
            name: spec.name.clone(),
            source,
        })?;

    info!(service = %spec.name, slot, port, "Started slot service");
    Ok(RunningService {
        name: spec.name.clone(),
        port,
        port_env: spec.port_env.clone(),
        child,
    })
}
