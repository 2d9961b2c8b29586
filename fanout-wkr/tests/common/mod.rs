pub mod logging;

pub use logging::init_test_logging;

use fanout_common::{Envelope, Message, Role, Transport};
use std::time::Duration;

/// Next record from the worker, failing the test after five seconds.
pub async fn next_from_worker(master: &Transport) -> Message {
    let envelope: Envelope = tokio::time::timeout(Duration::from_secs(5), master.receive())
        .await
        .expect("worker went quiet")
        .expect("worker closed the connection");
    assert_eq!(envelope.from, Role::Worker);
    envelope.message
}
