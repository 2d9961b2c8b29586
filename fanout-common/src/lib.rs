//! Shared building blocks for fanout.
//!
//! The coordinator (`fanout`) and the worker agent (`fanout-wkr`) both speak
//! the line-oriented message protocol defined here, over the transports
//! defined here, configured from the same TOML run configuration.

pub mod config;
pub mod logging;
pub mod output;
pub mod protocol;
pub mod transport;

pub use config::{
    ConfigError, ExecutorConfig, ExecutorRule, RetryConfig, RunConfig, ServiceSpec, SyncConfig,
    WorkerKind, WorkerSpec,
};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use output::OutputLock;
pub use protocol::{DecodeMode, Envelope, Message, PASS, ProtocolError, Role};
pub use transport::{RemoteSession, RemoteTarget, Transport, TransportError};
