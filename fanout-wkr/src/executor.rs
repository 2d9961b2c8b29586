//! Job execution.
//!
//! A [`JobExecutor`] turns a job identifier into output text: [`PASS`] when
//! the job passed, anything else is failure diagnostics. The runner owns
//! the executor and guards every call, so an executor may fail or panic
//! without taking the slot down.

use fanout_common::{ExecutorConfig, PASS};
use regex::Regex;
use shell_escape::unix::escape;
use std::borrow::Cow;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Placeholder replaced by the shell-escaped job id.
pub const JOB_PLACEHOLDER: &str = "{job}";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("No command configured for job '{0}'")]
    NoCommand(String),

    #[error("Invalid executor rule '{pattern}': {source}")]
    InvalidRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),
}

/// Runs one job and reports its output.
pub trait JobExecutor: Send + Sync + 'static {
    fn execute(&self, job: &str) -> impl Future<Output = Result<String, ExecutorError>> + Send;
}

impl<E: JobExecutor> JobExecutor for Arc<E> {
    fn execute(&self, job: &str) -> impl Future<Output = Result<String, ExecutorError>> + Send {
        self.as_ref().execute(job)
    }
}

/// Runs jobs as shell commands chosen by regex rules.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    rules: Vec<(Regex, String)>,
    default_command: Option<String>,
    env: Vec<(String, String)>,
}

impl CommandExecutor {
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, rule.command.clone()))
                    .map_err(|source| ExecutorError::InvalidRule {
                        pattern: rule.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            default_command: config.default_command.clone(),
            env: Vec::new(),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.push((key.into(), value.to_string()));
        self
    }

    pub fn with_envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    /// The shell command for `job`: first matching rule, else the default.
    pub fn command_for(&self, job: &str) -> Option<String> {
        let template = self
            .rules
            .iter()
            .find(|(re, _)| re.is_match(job))
            .map(|(_, command)| command.as_str())
            .or(self.default_command.as_deref())?;
        Some(template.replace(JOB_PLACEHOLDER, &escape(Cow::Borrowed(job))))
    }
}

impl JobExecutor for CommandExecutor {
    async fn execute(&self, job: &str) -> Result<String, ExecutorError> {
        let command = self
            .command_for(job)
            .ok_or_else(|| ExecutorError::NoCommand(job.to_string()))?;
        debug!(job, command = %command, "Executing job");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|source| ExecutorError::Spawn {
            command: command.clone(),
            source,
        })?;

        if output.status.success() {
            return Ok(PASS.to_string());
        }

        let status = match output.status.code() {
            Some(code) => format!("status {code}"),
            None => "a signal".to_string(),
        };
        let mut produced = String::from_utf8_lossy(&output.stdout).into_owned();
        produced.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(format!(
            "FAILURE: command ({command}) exited with {status} and produced:\n{produced}"
        ))
    }
}

/// Adapts an async closure into an executor.
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> JobExecutor for FnExecutor<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ExecutorError>> + Send,
{
    fn execute(&self, job: &str) -> impl Future<Output = Result<String, ExecutorError>> + Send {
        (self.0)(job.to_string())
    }
}
