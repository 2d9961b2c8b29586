//! Run events and the listener registry.
//!
//! The coordinator reports progress through [`Listener`] hooks. Listeners are
//! chosen by name from a [`ListenerRegistry`] that maps each name to a
//! constructor.

use crate::listeners::{MinimalOutput, ProgressBarListener, ReportGenerator};
use fanout_common::OutputLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Name of the listener that persists duration history.
pub const REPORT_GENERATOR: &str = "report_generator";

/// Observer of a run. Every hook defaults to a no-op.
pub trait Listener: Send + Sync {
    fn testing_begin(&self, _jobs: &[String]) {}
    fn worker_begin(&self, _worker: &str) {}
    /// Fires on every dispatch, retries included.
    fn job_begin(&self, _job: &str) {}
    /// Fires once per terminal result.
    fn job_end(&self, _job: &str, _output: &str) {}
    fn worker_end(&self, _worker: &str) {}
    fn testing_end(&self) {}
}

/// Everything a listener constructor may need.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    pub output: OutputLock,
    pub history_path: PathBuf,
}

#[derive(Debug, Error)]
#[error("Unknown listener '{name}' (known: {known})")]
pub struct UnknownListener {
    pub name: String,
    pub known: String,
}

type Constructor = fn(&ListenerContext) -> Box<dyn Listener>;

pub struct ListenerRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            constructors: BTreeMap::new(),
        };
        registry.register("minimal_output", |ctx| Box::new(MinimalOutput::new(ctx.output.clone())));
        registry.register("progress_bar", |ctx| Box::new(ProgressBarListener::new(ctx.output.clone())));
        registry.register(REPORT_GENERATOR, |ctx| {
            Box::new(ReportGenerator::new(ctx.history_path.clone()))
        });
        registry
    }
}

impl ListenerRegistry {
    pub fn register(&mut self, name: &'static str, constructor: Constructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Fail on the first name with no registered constructor.
    pub fn validate(&self, names: &[String]) -> Result<(), UnknownListener> {
        match names.iter().find(|name| !self.contains(name)) {
            Some(name) => Err(self.unknown(name)),
            None => Ok(()),
        }
    }

    pub fn build(&self, names: &[String], ctx: &ListenerContext) -> Result<Listeners, UnknownListener> {
        let listeners = names
            .iter()
            .map(|name| {
                self.constructors
                    .get(name.as_str())
                    .map(|construct| construct(ctx))
                    .ok_or_else(|| self.unknown(name))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Listeners::new(listeners))
    }

    fn unknown(&self, name: &str) -> UnknownListener {
        UnknownListener {
            name: name.to_string(),
            known: self.constructors.keys().copied().collect::<Vec<_>>().join(", "),
        }
    }
}

/// A set of listeners notified in registration order.
#[derive(Default)]
pub struct Listeners {
    inner: Vec<Box<dyn Listener>>,
}

impl Listeners {
    pub fn new(inner: Vec<Box<dyn Listener>>) -> Self {
        Self { inner }
    }

    pub fn push(&mut self, listener: Box<dyn Listener>) {
        self.inner.push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Listener for Listeners {
    fn testing_begin(&self, jobs: &[String]) {
        self.inner.iter().for_each(|l| l.testing_begin(jobs));
    }

    fn worker_begin(&self, worker: &str) {
        self.inner.iter().for_each(|l| l.worker_begin(worker));
    }

    fn job_begin(&self, job: &str) {
        self.inner.iter().for_each(|l| l.job_begin(job));
    }

    fn job_end(&self, job: &str, output: &str) {
        self.inner.iter().for_each(|l| l.job_end(job, output));
    }

    fn worker_end(&self, worker: &str) {
        self.inner.iter().for_each(|l| l.worker_end(worker));
    }

    fn testing_end(&self) {
        self.inner.iter().for_each(|l| l.testing_end());
    }
}
