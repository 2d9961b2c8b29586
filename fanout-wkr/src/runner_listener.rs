//! Runner lifecycle hooks, looked up by name.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Observes a runner's slot lifecycle. Hooks default to no-ops.
pub trait RunnerListener: Send + Sync {
    fn runner_begin(&self, _slot: usize) {}
    fn runner_end(&self, _slot: usize) {}
}

/// Logs slot lifecycle through tracing.
pub struct TraceListener;

impl RunnerListener for TraceListener {
    fn runner_begin(&self, slot: usize) {
        info!(slot, "Runner begin");
    }

    fn runner_end(&self, slot: usize) {
        info!(slot, "Runner end");
    }
}

#[derive(Debug, Error)]
#[error("Unknown runner listener '{0}'")]
pub struct UnknownRunnerListener(pub String);

type Constructor = fn() -> Box<dyn RunnerListener>;

/// Name to constructor mapping.
pub struct RunnerListenerRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl Default for RunnerListenerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            constructors: BTreeMap::new(),
        };
        registry.register("trace", || Box::new(TraceListener));
        registry
    }
}

impl RunnerListenerRegistry {
    pub fn register(&mut self, name: &'static str, constructor: Constructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    pub fn build(&self, names: &[String]) -> Result<Vec<Box<dyn RunnerListener>>, UnknownRunnerListener> {
        names
            .iter()
            .map(|name| {
                self.constructors
                    .get(name.as_str())
                    .map(|construct| construct())
                    .ok_or_else(|| UnknownRunnerListener(name.clone()))
            })
            .collect()
    }
}
