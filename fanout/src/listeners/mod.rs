//! Built-in run listeners.

mod minimal_output;
mod progress_bar;
mod report_generator;

pub use minimal_output::MinimalOutput;
pub use progress_bar::ProgressBarListener;
pub use report_generator::ReportGenerator;
