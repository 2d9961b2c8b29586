//! Run configuration.
//!
//! Loaded from a TOML file (default `fanout.toml`). Every field is optional;
//! an absent file yields the defaults: one local worker with one slot,
//! autosort on, and the database-deadlock transient signatures.
//!
//! ```toml
//! files = ["spec/models/user_spec.rb"]
//! listeners = ["progress_bar"]
//!
//! [[workers]]
//! kind = "local"
//! slots = 4
//!
//! [[workers]]
//! kind = "remote"
//! slots = 8
//! target = "ci@build-3"
//! ssh_opts = "-p 3022"
//! directory = "/srv/ci/app"
//!
//! [retry]
//! max_retries = 5
//!
//! [executor]
//! default_command = "ruby -Itest {job}"
//!
//! [[executor.rules]]
//! pattern = "_spec\\.rb$"
//! command = "bundle exec rspec {job}"
//! ```

use crate::transport::RemoteTarget;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fanout.toml";

/// Output signatures of infrastructure errors worth retrying.
pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    r"ActiveRecord::StatementInvalid(.*)[Dd]eadlock",
    r"PGError: ERROR(.*)[Dd]eadlock",
    r"Mysql::Error: SAVEPOINT(.*)does not exist: ROLLBACK",
    r"Mysql::Error: Deadlock found",
];

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid duration '{value}': {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Spawned on this machine.
    #[default]
    Local,
    /// Spawned over ssh.
    #[serde(alias = "ssh")]
    Remote,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Boot specification for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    #[serde(default)]
    pub kind: WorkerKind,
    /// Number of runner slots.
    #[serde(default = "default_slots")]
    pub slots: u32,
    /// ssh connection target (remote only).
    #[serde(default)]
    pub target: Option<String>,
    /// Extra ssh options (remote only).
    #[serde(default)]
    pub ssh_opts: String,
    /// Working directory on the remote host (remote only).
    #[serde(default)]
    pub directory: Option<String>,
    /// Replaces the default worker launch command (remote only).
    #[serde(default)]
    pub command: Option<String>,
}

impl WorkerSpec {
    pub fn local(slots: u32) -> Self {
        Self {
            kind: WorkerKind::Local,
            slots,
            target: None,
            ssh_opts: String::new(),
            directory: None,
            command: None,
        }
    }

    pub fn remote(target: impl Into<String>, directory: impl Into<String>, slots: u32) -> Self {
        Self {
            kind: WorkerKind::Remote,
            slots,
            target: Some(target.into()),
            ssh_opts: String::new(),
            directory: Some(directory.into()),
            command: None,
        }
    }

    /// Human-readable identity used in logs and listener events.
    pub fn label(&self, index: usize) -> String {
        match (self.kind, &self.target) {
            (WorkerKind::Remote, Some(target)) => format!("{target}#{index}"),
            _ => format!("local#{index}"),
        }
    }

    /// The ssh target for a remote worker.
    pub fn remote_target(&self) -> Option<RemoteTarget> {
        match (self.kind, &self.target, &self.directory) {
            (WorkerKind::Remote, Some(target), Some(directory)) => {
                Some(RemoteTarget::new(target.clone(), directory.clone()).with_ssh_opts(&self.ssh_opts))
            }
            _ => None,
        }
    }
}

/// Transient-failure retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Regexes matched against job output.
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,
    /// Retries allowed per job; unbounded when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient_patterns: default_transient_patterns(),
            max_retries: None,
        }
    }
}

impl RetryConfig {
    pub fn compile(&self) -> Result<Vec<Regex>, ConfigError> {
        self.transient_patterns.iter().map(|p| compile_pattern(p)).collect()
    }
}

/// Command-based job executor settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Command used when no rule matches. `{job}` is replaced by the job id.
    #[serde(default)]
    pub default_command: Option<String>,
    /// First matching rule wins.
    #[serde(default)]
    pub rules: Vec<ExecutorRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorRule {
    /// Regex matched against the job id.
    pub pattern: String,
    pub command: String,
}

/// A background process each runner slot starts for itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// `{port}` and `{slot}` are substituted.
    pub command: String,
    /// Environment variable carrying the chosen port into jobs.
    #[serde(default)]
    pub port_env: Option<String>,
}

/// rsync staging of the local tree onto remote workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub directory: PathBuf,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub rsync_opts: String,
    #[serde(default)]
    pub reverse_sync_direction: bool,
}

/// Complete run configuration shared by coordinator and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub verbose: bool,
    /// Order jobs by historical duration, longest first.
    #[serde(default = "default_true")]
    pub autosort: bool,
    #[serde(default)]
    pub history_file: Option<PathBuf>,
    #[serde(default)]
    pub listeners: Vec<String>,
    #[serde(default)]
    pub runner_listeners: Vec<String>,
    #[serde(default = "default_signals")]
    pub signals: Vec<String>,
    /// Exported to remote workers as `FANOUT_ENV`.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Path to the `fanout-wkr` binary.
    #[serde(default)]
    pub worker_bin: Option<String>,
    /// Idle period after which runners and workers ping upward, e.g. "30s".
    #[serde(default)]
    pub keepalive: Option<String>,
    #[serde(default)]
    pub runner_log_file: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerSpec>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            verbose: false,
            autosort: true,
            history_file: None,
            listeners: Vec::new(),
            runner_listeners: Vec::new(),
            signals: default_signals(),
            environment: default_environment(),
            worker_bin: None,
            keepalive: None,
            runner_log_file: None,
            workers: default_workers(),
            retry: RetryConfig::default(),
            executor: ExecutorConfig::default(),
            services: Vec::new(),
            sync: None,
        }
    }
}

impl RunConfig {
    /// Parse configuration text; `origin` is only used in error messages.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load and validate a config file that must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load_optional(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.is_empty() {
            return Err(ConfigError::Invalid("at least one worker is required".to_string()));
        }
        for (index, worker) in self.workers.iter().enumerate() {
            if worker.slots == 0 {
                return Err(ConfigError::Invalid(format!(
                    "worker {index} must have at least one slot"
                )));
            }
            if worker.kind == WorkerKind::Remote {
                if worker.target.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::Invalid(format!(
                        "remote worker {index} needs a target"
                    )));
                }
                if worker.directory.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::Invalid(format!(
                        "remote worker {index} needs a directory"
                    )));
                }
            }
        }

        self.retry.compile()?;
        for rule in &self.executor.rules {
            compile_pattern(&rule.pattern)?;
        }
        for service in &self.services {
            if service.name.is_empty() || service.command.is_empty() {
                return Err(ConfigError::Invalid(
                    "services need a name and a command".to_string(),
                ));
            }
        }
        self.keepalive_interval()?;
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Result<Option<Duration>, ConfigError> {
        self.keepalive
            .as_deref()
            .map(|value| {
                humantime::parse_duration(value).map_err(|source| ConfigError::InvalidDuration {
                    value: value.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Location of the persisted duration history.
    pub fn history_path(&self) -> PathBuf {
        self.history_file.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("fanout")
                .join("heuristics.json")
        })
    }

    /// Log file for the runner in `slot`.
    pub fn runner_log_path(&self, slot: usize) -> PathBuf {
        match &self.runner_log_file {
            Some(path) => path.clone(),
            None => PathBuf::from("log").join(format!("fanout-runner-{slot}.log")),
        }
    }

    pub fn remote_workers(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.workers.iter().filter(|w| w.kind == WorkerKind::Remote)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn default_true() -> bool {
    true
}

fn default_slots() -> u32 {
    1
}

fn default_signals() -> Vec<String> {
    vec!["SIGTERM".to_string(), "SIGINT".to_string()]
}

fn default_environment() -> String {
    "test".to_string()
}

fn default_workers() -> Vec<WorkerSpec> {
    vec![WorkerSpec::local(1)]
}

fn default_transient_patterns() -> Vec<String> {
    DEFAULT_TRANSIENT_PATTERNS.iter().map(|p| p.to_string()).collect()
}
