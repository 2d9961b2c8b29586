//! Transports over real child processes that echo and chatter the way a
//! remote shell does.

#![cfg(unix)]

mod common;

use common::init_test_logging;
use fanout_common::transport::spawn_local;
use fanout_common::{Envelope, Message, Role};
use std::time::Duration;
use tokio::process::Command;

fn shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[tokio::test]
async fn test_echoed_records_keep_their_sender_role() {
    init_test_logging();
    test_log!("TEST START: test_echoed_records_keep_their_sender_role");

    let script = r#"
echo connected
read line
echo "$line"
echo '{"from":"worker","type":"worker_ready"}'
"#;
    let (transport, mut child) = spawn_local(shell(script), Role::Master, "echoing-shell").unwrap();

    transport
        .send(Message::RunJob { job: "a_spec.rb".to_string() })
        .await
        .unwrap();

    let echoed = transport.receive().await.unwrap();
    assert_eq!(echoed.from, Role::Master);

    let ready = transport.receive().await.unwrap();
    assert_eq!(ready, Envelope::new(Role::Worker, Message::WorkerReady));

    assert_eq!(transport.receive().await, None);
    child.wait().await.unwrap();
    test_log!("TEST PASS: test_echoed_records_keep_their_sender_role");
}

#[tokio::test]
async fn test_child_exit_is_end_of_stream() {
    init_test_logging();
    test_log!("TEST START: test_child_exit_is_end_of_stream");

    let (transport, mut child) = spawn_local(shell("exit 3"), Role::Master, "dying").unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), transport.receive())
        .await
        .expect("end of stream within timeout");
    assert!(received.is_none());

    let status = child.wait().await.unwrap();
    assert_eq!(status.code(), Some(3));
    test_log!("TEST PASS: test_child_exit_is_end_of_stream");
}

#[tokio::test]
async fn test_close_lets_reading_child_finish() {
    init_test_logging();
    test_log!("TEST START: test_close_lets_reading_child_finish");

    let (transport, mut child) =
        spawn_local(shell("while read line; do :; done; exit 0"), Role::Master, "reader").unwrap();
    transport.send(Message::Shutdown).await.unwrap();
    transport.close().await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("child exits once stdin closes")
        .unwrap();
    assert!(status.success());
    test_log!("TEST PASS: test_close_lets_reading_child_finish");
}
