//! Records per-job timings and persists them as the duration history.

use crate::history::{HistoryReport, JobTiming, now_seconds};
use crate::listener::Listener;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

pub struct ReportGenerator {
    path: PathBuf,
    started: Mutex<HashMap<String, f64>>,
    report: Mutex<HistoryReport>,
}

impl ReportGenerator {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            started: Mutex::new(HashMap::new()),
            report: Mutex::new(HistoryReport::default()),
        }
    }

    pub fn report(&self) -> HistoryReport {
        self.report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Listener for ReportGenerator {
    /// A retried job restarts its clock.
    fn job_begin(&self, job: &str) {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.to_string(), now_seconds());
    }

    fn job_end(&self, job: &str, _output: &str) {
        let end = now_seconds();
        let start = self
            .started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job)
            .unwrap_or(end);
        self.report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(job, JobTiming::new(start, end));
    }

    fn testing_end(&self) {
        let report = self.report();
        match report.save(&self.path) {
            Ok(()) => info!(path = %self.path.display(), jobs = report.len(), "Saved job history"),
            Err(err) => warn!("{}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timings_are_recorded_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heuristics.json");
        HistoryReport::default().save(&path).unwrap();

        let listener = ReportGenerator::new(path.clone());
        listener.job_begin("a");
        std::thread::sleep(std::time::Duration::from_millis(20));
        listener.job_end("a", ".");
        listener.job_begin("b");
        listener.job_end("b", "failed");
        listener.testing_end();

        let saved = HistoryReport::load(&path);
        assert_eq!(saved.len(), 2);
        assert!(saved.duration("a").unwrap() >= 0.015);
        let b = saved.get("b").unwrap();
        assert!(b.end >= b.start);
    }
}
