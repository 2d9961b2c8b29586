//! Tracing setup shared by the three binaries.
//!
//! Workers and runners use stdout as their message channel, so their logs go
//! to stderr or to a file and never to stdout. The filter comes from
//! `FANOUT_LOG` (an `EnvFilter` directive) and falls back to a level chosen on
//! the command line; `FANOUT_LOG_FORMAT=json` switches to JSON lines.

use crate::transport::REMOTE_MARKER;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "FANOUT_LOG";

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "FANOUT_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Where log lines go and how they look.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `FANOUT_LOG` is unset, e.g. `info`.
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Tag every line as coming from a remote host.
    pub remote: bool,
    directive: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            remote: false,
            directive: None,
        }
    }
}

impl LogConfig {
    /// `default_level` overlaid with `FANOUT_LOG` and `FANOUT_LOG_FORMAT`.
    pub fn from_env(default_level: &str) -> Self {
        let mut config = Self::default().with_level(default_level);
        config.directive = std::env::var(LOG_ENV).ok().filter(|v| !v.trim().is_empty());
        if let Ok(format) = std::env::var(LOG_FORMAT_ENV) {
            config.format = LogFormat::parse(&format);
        }
        config
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Raise the level to `debug` when `verbose`; otherwise keep it.
    pub fn verbose(self, verbose: bool) -> Self {
        if verbose { self.with_level("debug") } else { self }
    }

    /// Log to stderr (the default).
    pub fn with_stderr(mut self) -> Self {
        self.file = None;
        self
    }

    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    fn filter(&self) -> EnvFilter {
        self.directive
            .as_deref()
            .and_then(|d| EnvFilter::try_new(d).ok())
            .or_else(|| EnvFilter::try_new(&self.level).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Keeps the non-blocking file writer alive; drop it last in `main`.
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Calling it twice is harmless, the second
/// call leaves the first subscriber in place.
pub fn init_logging(config: &LogConfig) -> std::io::Result<LoggingGuards> {
    let (writer, guard) = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (fmt::writer::BoxMakeWriter::new(writer), Some(guard))
        }
        None if config.remote => (
            fmt::writer::BoxMakeWriter::new(|| RemoteTagged(std::io::stderr())),
            None,
        ),
        None => (fmt::writer::BoxMakeWriter::new(std::io::stderr), None),
    };

    let ansi = config.file.is_none() && !config.remote;
    let layer = match config.format {
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        LogFormat::Text => fmt::layer().with_ansi(ansi).with_writer(writer).boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(config.filter())
        .with(layer)
        .try_init();

    Ok(LoggingGuards { _file: guard })
}

/// Prefixes every log line with the remote marker so the coordinator can
/// tell worker logs from protocol records on an ssh channel.
struct RemoteTagged<W>(W);

impl<W: Write> Write for RemoteTagged<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.0.write_all(REMOTE_MARKER.as_bytes())?;
        self.0.write_all(b" ")?;
        self.0.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Text);
    }

    #[test]
    fn test_verbose_selects_debug() {
        assert_eq!(LogConfig::default().verbose(true).level, "debug");
        assert_eq!(LogConfig::default().verbose(false).level, "info");
    }

    #[test]
    fn test_quiet_run_keeps_the_default_level() {
        let quiet = LogConfig::default().with_level("warn").verbose(false);
        assert_eq!(quiet.level, "warn");
        let loud = LogConfig::default().with_level("warn").verbose(true);
        assert_eq!(loud.level, "debug");
    }

    #[test]
    fn test_stderr_clears_file() {
        let config = LogConfig::default().with_file("log/x.log").with_stderr();
        assert!(config.file.is_none());
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let config = LogConfig::default().with_level("not a [valid directive");
        // Must not panic.
        let _ = config.filter();
    }

    #[test]
    fn test_remote_lines_are_tagged() {
        let mut out = RemoteTagged(Vec::new());
        out.write_all(b"INFO booting runners\n").unwrap();
        assert_eq!(String::from_utf8(out.0).unwrap(), "REMOTE INFO booting runners\n");
    }

    #[test]
    fn test_file_logging_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("runner-0.log");
        let config = LogConfig::default().with_file(&path);
        let guards = init_logging(&config).unwrap();
        drop(guards);
        assert!(path.exists());
    }
}
