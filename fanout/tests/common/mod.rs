#![allow(dead_code, unused_imports)]

pub mod fake_worker;
pub mod logging;

pub use fake_worker::{Behavior, FakeLauncher, Stats};
pub use logging::init_test_logging;

use fanout::Listener;
use std::sync::{Arc, Mutex};

/// Records listener events as strings.
#[derive(Clone, Default)]
pub struct EventLog(pub Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }
}

impl Listener for EventLog {
    fn testing_begin(&self, jobs: &[String]) {
        self.push(format!("testing_begin {}", jobs.join(",")));
    }

    fn worker_begin(&self, worker: &str) {
        self.push(format!("worker_begin {worker}"));
    }

    fn job_begin(&self, job: &str) {
        self.push(format!("job_begin {job}"));
    }

    fn job_end(&self, job: &str, output: &str) {
        self.push(format!("job_end {job} {output}"));
    }

    fn worker_end(&self, worker: &str) {
        self.push(format!("worker_end {worker}"));
    }

    fn testing_end(&self) {
        self.push("testing_end".to_string());
    }
}
