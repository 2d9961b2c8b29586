//! Parent end of a locally spawned child process.

use super::{Transport, TransportError};
use crate::protocol::Role;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Spawn `command` with piped stdin/stdout and wrap them as a transport.
///
/// The child's stderr is inherited so its logs reach the terminal without
/// touching the message channel. The caller owns the returned [`Child`] and
/// must reap it.
pub fn spawn_local(
    mut command: Command,
    role: Role,
    label: impl Into<String>,
) -> Result<(Transport, Child), TransportError> {
    let label = label.into();
    let program = command.as_std().get_program().to_string_lossy().to_string();

    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|source| TransportError::Spawn { program: program.clone(), source })?;
    debug!(transport = %label, program = %program, pid = ?child.id(), "Spawned local child");

    let transport = Transport::from_child(&mut child, role, label)?;
    Ok((transport, child))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, Message};

    #[tokio::test]
    async fn test_spawn_local_round_trips_through_cat() {
        let (transport, mut child) = spawn_local(Command::new("cat"), Role::Master, "cat").unwrap();

        transport.send(Message::Ping).await.unwrap();
        assert_eq!(
            transport.receive().await,
            Some(Envelope::new(Role::Master, Message::Ping))
        );

        transport.close().await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_spawn_local_reports_missing_program() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let err = spawn_local(
                Command::new("/nonexistent/fanout-test-binary"),
                Role::Master,
                "missing",
            )
            .unwrap_err();
            assert!(matches!(err, TransportError::Spawn { .. }));
        });
    }
}
