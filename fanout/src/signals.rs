//! Interrupt handling.
//!
//! Signals never touch run state directly. They cancel a token that the
//! coordinator observes, which then runs the normal shutdown cascade.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Unsupported signal '{0}'")]
    Unsupported(String),

    #[error("Failed to install handler for {name}: {source}")]
    Install {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(unix)]
mod imp {
    use super::SignalError;
    use futures::future::select_all;
    use tokio::signal::unix::{SignalKind, signal};
    use tokio_util::sync::CancellationToken;
    use tracing::info;

    pub fn kind_for(name: &str) -> Result<SignalKind, SignalError> {
        let bare = name.trim().trim_start_matches("SIG").to_ascii_uppercase();
        match bare.as_str() {
            "TERM" => Ok(SignalKind::terminate()),
            "INT" => Ok(SignalKind::interrupt()),
            "HUP" => Ok(SignalKind::hangup()),
            "QUIT" => Ok(SignalKind::quit()),
            "USR1" => Ok(SignalKind::user_defined1()),
            "USR2" => Ok(SignalKind::user_defined2()),
            _ => Err(SignalError::Unsupported(name.to_string())),
        }
    }

    pub fn install(names: &[String]) -> Result<CancellationToken, SignalError> {
        let token = CancellationToken::new();

        let mut streams = Vec::with_capacity(names.len());
        for name in names {
            let stream = signal(kind_for(name)?).map_err(|source| SignalError::Install {
                name: name.clone(),
                source,
            })?;
            streams.push((name.clone(), stream));
        }
        if streams.is_empty() {
            return Ok(token);
        }

        let cancel = token.clone();
        tokio::spawn(async move {
            let waits = streams.iter_mut().map(|(name, stream)| {
                Box::pin(async move {
                    stream.recv().await;
                    name.clone()
                })
            });
            let (name, _, _) = select_all(waits).await;
            info!("Received {}, initiating shutdown", name);
            cancel.cancel();
        });

        Ok(token)
    }
}

#[cfg(not(unix))]
mod imp {
    use super::SignalError;
    use tokio_util::sync::CancellationToken;
    use tracing::info;

    pub fn install(names: &[String]) -> Result<CancellationToken, SignalError> {
        let token = CancellationToken::new();
        if names.is_empty() {
            return Ok(token);
        }
        let cancel = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, initiating shutdown");
                cancel.cancel();
            }
        });
        Ok(token)
    }
}

/// Install handlers for `names` (e.g. `SIGTERM`, `INT`). The returned token
/// is cancelled when the first of them arrives.
pub fn install_interrupt_handler(names: &[String]) -> Result<CancellationToken, SignalError> {
    imp::install(names)
}
