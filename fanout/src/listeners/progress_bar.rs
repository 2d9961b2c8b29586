//! Terminal progress bar. Failures print above the bar as they arrive and
//! the bar turns red after the first one.

use crate::listener::Listener;
use colored::Colorize;
use fanout_common::{OutputLock, PASS};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};

const TEMPLATE_OK: &str = "{prefix} [{elapsed_precise}] {bar:40.green/white} {pos}/{len} {msg}";
const TEMPLATE_FAILED: &str = "{prefix} [{elapsed_precise}] {bar:40.red/white} {pos}/{len} {msg}";

pub struct ProgressBarListener {
    output: OutputLock,
    bar: ProgressBar,
    failures: AtomicUsize,
}

impl ProgressBarListener {
    pub fn new(output: OutputLock) -> Self {
        Self::with_bar(output, ProgressBar::new(0))
    }

    /// A listener whose bar is never drawn.
    pub fn hidden(output: OutputLock) -> Self {
        Self::with_bar(output, ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden()))
    }

    fn with_bar(output: OutputLock, bar: ProgressBar) -> Self {
        if let Ok(style) = ProgressStyle::with_template(TEMPLATE_OK) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix("fanout");
        Self {
            output,
            bar,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Listener for ProgressBarListener {
    fn testing_begin(&self, jobs: &[String]) {
        self.bar.set_length(jobs.len() as u64);
        self.bar.set_message("starting");
    }

    fn worker_begin(&self, worker: &str) {
        self.bar.set_message(format!("{worker} ready"));
    }

    fn job_end(&self, job: &str, output: &str) {
        if output != PASS {
            let first = self.failures.fetch_add(1, Ordering::SeqCst) == 0;
            if first && let Ok(style) = ProgressStyle::with_template(TEMPLATE_FAILED) {
                self.bar.set_style(style.progress_chars("=> "));
            }
            let report = format!("{}\n{}", job.red().bold(), output);
            self.bar.suspend(|| self.output.write_line(&report));
        }
        self.bar.set_message(job.to_string());
        self.bar.inc(1);
    }

    fn testing_end(&self) {
        let failures = self.failures();
        let summary = if failures == 0 {
            "done".green().to_string()
        } else {
            format!("{failures} failed").red().to_string()
        };
        self.bar.finish_with_message(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_terminal_results_and_failures() {
        let listener = ProgressBarListener::hidden(OutputLock::new(std::io::sink()));
        listener.testing_begin(&["a".to_string(), "b".to_string(), "c".to_string()]);
        listener.job_end("a", PASS);
        listener.job_end("b", "boom");
        listener.job_end("c", "boom again");
        listener.testing_end();

        assert_eq!(listener.position(), 3);
        assert_eq!(listener.failures(), 2);
    }
}
