//! Dot-per-job output with failures printed at the end.

use crate::listener::Listener;
use colored::Colorize;
use fanout_common::{OutputLock, PASS};
use std::io::Write;
use std::sync::Mutex;

pub struct MinimalOutput {
    output: OutputLock,
    failures: Mutex<Vec<(String, String)>>,
}

impl MinimalOutput {
    pub fn new(output: OutputLock) -> Self {
        Self {
            output,
            failures: Mutex::new(Vec::new()),
        }
    }
}

impl Listener for MinimalOutput {
    fn testing_begin(&self, jobs: &[String]) {
        self.output.write_line(&format!("Running {} jobs", jobs.len()));
    }

    fn job_end(&self, job: &str, output: &str) {
        if output == PASS {
            self.output.write(".");
        } else {
            self.output.write(&"F".red().to_string());
            self.failures
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((job.to_string(), output.to_string()));
        }
    }

    fn testing_end(&self) {
        let failures = std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()));
        self.output.with(|out| {
            let _ = writeln!(out);
            for (job, output) in &failures {
                let _ = writeln!(out, "\n{}\n{}", job.bold(), output);
            }
            if failures.is_empty() {
                let _ = writeln!(out, "{}", "All jobs passed".green());
            } else {
                let _ = writeln!(out, "{}", format!("{} failed", failures.len()).red());
            }
            let _ = out.flush();
        });
    }
}
