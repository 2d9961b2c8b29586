//! Job duration history and the longest-first scheduling heuristic.
//!
//! The report is a JSON object keyed by job id:
//!
//! ```json
//! {"spec/models/user_spec.rb": {"start": 1760000000.1, "end": 1760000004.6, "duration": 4.5}}
//! ```
//!
//! It is read once before a run to order the queue and written once after,
//! merged into whatever is already on disk.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to write history {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Timing of a job's last run, in seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobTiming {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

impl JobTiming {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            duration: (end - start).max(0.0),
        }
    }
}

/// Seconds since the Unix epoch with microsecond resolution.
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryReport {
    entries: BTreeMap<String, JobTiming>,
}

impl HistoryReport {
    /// Read a report. A missing or unparsable file is an empty history.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %path.display(), "No history loaded: {}", err);
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(report) => report,
            Err(err) => {
                warn!(path = %path.display(), "Ignoring unreadable history: {}", err);
                Self::default()
            }
        }
    }

    /// Merge into the report on disk and write the result.
    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        let mut merged = Self::load(path);
        merged.merge(self);

        let write_error = |source| HistoryError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let json = serde_json::to_string_pretty(&merged)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(write_error)?;
        std::fs::rename(&tmp, path).map_err(write_error)?;
        debug!(path = %path.display(), jobs = merged.len(), "History saved");
        Ok(())
    }

    /// Entries in `other` replace ours.
    pub fn merge(&mut self, other: &HistoryReport) {
        for (job, timing) in &other.entries {
            self.entries.insert(job.clone(), *timing);
        }
    }

    pub fn record(&mut self, job: impl Into<String>, timing: JobTiming) {
        self.entries.insert(job.into(), timing);
    }

    pub fn get(&self, job: &str) -> Option<&JobTiming> {
        self.entries.get(job)
    }

    pub fn duration(&self, job: &str) -> Option<f64> {
        self.entries.get(job).map(|t| t.duration)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Order jobs longest-first by recorded duration. Jobs without history go
/// after every known job, keeping their relative order.
pub fn sort_by_history(mut jobs: Vec<String>, history: &HistoryReport) -> Vec<String> {
    jobs.sort_by(|a, b| match (history.duration(a), history.duration(b)) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    jobs
}
