//! Serialized access to the shared terminal.
//!
//! Listeners render from several connection tasks at once. One lock object
//! is created at process start and handed to everything that writes to the
//! terminal, so partial lines never interleave. It is never held across an
//! `.await`.

use std::io::Write;
use std::sync::{Arc, Mutex};

type Sink = Box<dyn Write + Send>;

/// Cloneable handle to the process-wide output stream.
#[derive(Clone)]
pub struct OutputLock {
    sink: Arc<Mutex<Sink>>,
}

impl std::fmt::Debug for OutputLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLock").finish_non_exhaustive()
    }
}

impl Default for OutputLock {
    fn default() -> Self {
        Self::stdout()
    }
}

impl OutputLock {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    /// Write `text` as one uninterrupted chunk and flush.
    pub fn write(&self, text: &str) {
        self.with(|out| {
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        });
    }

    pub fn write_line(&self, text: &str) {
        self.with(|out| {
            let _ = writeln!(out, "{text}");
            let _ = out.flush();
        });
    }

    /// Run `f` with exclusive access to the stream.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn Write) -> R) -> R {
        let mut guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        f(guard.as_mut())
    }
}
