//! Bidirectional, line-oriented message channels.
//!
//! A [`Transport`] wraps any byte reader/writer pair and speaks the
//! [`protocol`](crate::protocol) over it. Constructors cover the ways the
//! dispatch tree is wired together:
//!
//! - [`Transport::pair`]: in-memory duplex, for in-process wiring and tests
//! - [`local::spawn_local`] / [`Transport::stdio`]: the parent and child ends
//!   of a locally spawned process with piped stdio
//! - [`RemoteSession::open`]: an `ssh -tt` session whose stdio is the channel
//!
//! `close` is idempotent and may be called from any task; it wakes a task
//! blocked in `receive`, which then reports end-of-stream.

pub mod local;
pub mod remote;

pub use local::spawn_local;
pub use remote::{RemoteSession, RemoteTarget};

use crate::protocol::{self, DecodeMode, Envelope, Message, ProtocolError, Role};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Buffer size for in-memory transport pairs.
const PAIR_BUFFER: usize = 64 * 1024;

/// Upper bound on flushing the farewell line while closing.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Marker carried by log lines that a remote worker writes onto the channel.
pub const REMOTE_MARKER: &str = "REMOTE";

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors raised by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport {0} is closed")]
    Closed(String),

    #[error("I/O error on transport {label}: {source}")]
    Io {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Child process for {0} has no piped stdio")]
    MissingStdio(String),
}

/// Outcome of a bounded wait for the next message.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Message(Envelope),
    /// Nothing arrived within the wait.
    Idle,
    /// End of stream: the peer went away or the transport was closed.
    Closed,
}

/// A message channel to one peer.
pub struct Transport {
    role: Role,
    label: String,
    mode: DecodeMode,
    reader: Mutex<Option<Lines<BufReader<BoxedReader>>>>,
    writer: Mutex<Option<BoxedWriter>>,
    farewell: Option<String>,
    closed: CancellationToken,
    close_started: AtomicBool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.role)
            .field("label", &self.label)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Wrap a reader/writer pair. Messages sent through this end are stamped
    /// with `role`.
    pub fn new<R, W>(role: Role, label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            role,
            label: label.into(),
            mode: DecodeMode::Tolerant,
            reader: Mutex::new(Some(BufReader::new(reader).lines())),
            writer: Mutex::new(Some(writer)),
            farewell: None,
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
        }
    }

    /// Connected in-memory ends. The first end sends as `upper`, the second
    /// as `lower`.
    pub fn pair(upper: Role, lower: Role, label: impl Into<String>) -> (Self, Self) {
        let label = label.into();
        let (upper_io, lower_io) = tokio::io::duplex(PAIR_BUFFER);
        let (upper_read, upper_write) = tokio::io::split(upper_io);
        let (lower_read, lower_write) = tokio::io::split(lower_io);
        (
            Self::new(upper, label.clone(), upper_read, upper_write),
            Self::new(lower, label, lower_read, lower_write),
        )
    }

    /// The child end of a spawned process: this process's stdin/stdout.
    pub fn stdio(role: Role, label: impl Into<String>) -> Self {
        Self::new(role, label, tokio::io::stdin(), tokio::io::stdout())
    }

    /// The parent end of a spawned process: takes the child's piped stdio.
    pub fn from_child(child: &mut Child, role: Role, label: impl Into<String>) -> Result<Self, TransportError> {
        let label = label.into();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::MissingStdio(label.clone()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::MissingStdio(label.clone()))?;
        Ok(Self::new(role, label, stdout, stdin))
    }

    /// Set how non-record lines are treated.
    pub fn with_mode(mut self, mode: DecodeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Raw line written to the peer just before the channel closes.
    pub fn with_farewell(mut self, line: impl Into<String>) -> Self {
        self.farewell = Some(line.into());
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send one message, stamped with this end's role.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        let line = protocol::encode(&Envelope::new(self.role, message))?;
        self.write_line(&line).await
    }

    /// Write a raw line that is not a protocol record (shell bootstrap).
    pub async fn send_raw(&self, line: &str) -> Result<(), TransportError> {
        self.write_line(line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.label.clone()));
        }

        let mut guard = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed(self.label.clone())),
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Closed(self.label.clone()));
        };

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };

        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed(self.label.clone())),
            result = write => result.map_err(|source| self.io_error(source)),
        }
    }

    /// Wait for the next message.
    ///
    /// Returns `None` at end-of-stream, including after [`close`](Self::close).
    /// Records that fail to decode are logged and skipped.
    pub async fn receive(&self) -> Option<Envelope> {
        loop {
            match self.try_receive().await {
                Ok(next) => return next,
                Err(err) => warn!(transport = %self.label, "Dropping undecodable line: {}", err),
            }
        }
    }

    /// Like [`receive`](Self::receive) but surfaces decode failures, which
    /// only occur in [`DecodeMode::Strict`].
    pub async fn try_receive(&self) -> Result<Option<Envelope>, TransportError> {
        if self.is_closed() {
            return Ok(None);
        }

        let mut guard = tokio::select! {
            _ = self.closed.cancelled() => return Ok(None),
            guard = self.reader.lock() => guard,
        };
        let Some(lines) = guard.as_mut() else {
            return Ok(None);
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Ok(None),
                next = lines.next_line() => next,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(transport = %self.label, "End of stream");
                    return Ok(None);
                }
                Err(err) => {
                    debug!(transport = %self.label, "Read failed, treating as end of stream: {}", err);
                    return Ok(None);
                }
            };

            match protocol::decode(&line, self.mode) {
                Ok(Some(envelope)) => {
                    trace!(
                        transport = %self.label,
                        from = %envelope.from,
                        kind = envelope.message.kind(),
                        "Received message"
                    );
                    return Ok(Some(envelope));
                }
                Ok(None) => {
                    if line.contains(REMOTE_MARKER) {
                        debug!(transport = %self.label, "{}", line.trim_end());
                    } else {
                        trace!(transport = %self.label, "Not a message: {:?}", line);
                    }
                }
                Err(ProtocolError::Malformed { line, reason }) if self.mode == DecodeMode::Tolerant => {
                    debug!(transport = %self.label, "Ignoring malformed record {:?}: {}", line, reason);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Wait at most `idle` for the next message.
    pub async fn receive_within(&self, idle: Duration) -> Received {
        match tokio::time::timeout(idle, self.receive()).await {
            Ok(Some(envelope)) => Received::Message(envelope),
            Ok(None) => Received::Closed,
            Err(_) => Received::Idle,
        }
    }

    /// Close both directions. Idempotent; wakes any pending `receive`.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();

        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };

        let label = self.label.clone();
        let farewell = self.farewell.clone();
        let finish = async move {
            if let Some(line) = farewell {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            writer.shutdown().await
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, finish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) if is_disconnect(&source) => Ok(()),
            Ok(Err(source)) => Err(TransportError::Io { label, source }),
            Err(_) => {
                debug!(transport = %label, "Timed out flushing on close");
                Ok(())
            }
        }
    }

    fn io_error(&self, source: std::io::Error) -> TransportError {
        if is_disconnect(&source) {
            TransportError::Closed(self.label.clone())
        } else {
            TransportError::Io {
                label: self.label.clone(),
                source,
            }
        }
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof
    )
}
