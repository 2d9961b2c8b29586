//! Message protocol spoken between master, workers and runners.
//!
//! Every message travels as exactly one line: a JSON object carrying the
//! sender role and the message discriminant, e.g.
//!
//! ```text
//! {"from":"master","type":"run_job","job":"spec/models/user_spec.rb"}
//! ```
//!
//! A line only counts as a candidate record when it opens with `{`. Remote
//! shells echo input and interleave stderr, so anything else on the channel is
//! noise: ignored in [`DecodeMode::Tolerant`], an error in [`DecodeMode::Strict`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output reported for a job that passed.
pub const PASS: &str = ".";

/// Longest slice of an offending line kept in error messages.
const SNIPPET_LEN: usize = 120;

/// Errors produced while encoding or decoding wire records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message could not be turned into a single wire record.
    #[error("Unprocessable message: {0}")]
    Unprocessable(String),

    /// The line looked like a record but is not a valid message.
    #[error("Malformed record '{line}': {reason}")]
    Malformed { line: String, reason: String },

    /// The line is not a record at all (strict mode only).
    #[error("Not a message: '{0}'")]
    NotAMessage(String),
}

/// Which tier of the dispatch tree sent a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Worker,
    Runner,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
            Self::Runner => write!(f, "runner"),
        }
    }
}

/// The closed set of protocol messages.
///
/// `RequestJob`, `Result`, `Ping` and `WorkerReady` travel upward;
/// `RunJob` and `Shutdown` travel downward. The wire format does not enforce
/// direction, receivers filter on the sender [`Role`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A slot is idle and wants work.
    RequestJob,
    /// Run this job.
    RunJob { job: String },
    /// Outcome of a job: [`PASS`] or failure diagnostics.
    Result { job: String, output: String },
    /// Keepalive.
    Ping,
    /// A worker finished booting its runners.
    WorkerReady,
    /// Tear down and exit.
    Shutdown,
}

impl Message {
    /// Short name of the variant, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestJob => "request_job",
            Self::RunJob { .. } => "run_job",
            Self::Result { .. } => "result",
            Self::Ping => "ping",
            Self::WorkerReady => "worker_ready",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A message stamped with the role of its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Role,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(from: Role, message: Message) -> Self {
        Self { from, message }
    }
}

/// How to treat lines that are not records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// Skip noise silently.
    #[default]
    Tolerant,
    /// Report noise as [`ProtocolError::NotAMessage`].
    Strict,
}

/// Encode an envelope as one wire record, without the trailing newline.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(envelope)
        .map_err(|e| ProtocolError::Unprocessable(e.to_string()))?;
    if line.contains('\n') {
        return Err(ProtocolError::Unprocessable(
            "record spans more than one line".to_string(),
        ));
    }
    Ok(line)
}

/// Decode one line.
///
/// Returns `Ok(None)` for noise in tolerant mode. Lines that open with `{`
/// but do not describe a known message are always reported as
/// [`ProtocolError::Malformed`]; the caller decides whether that is fatal.
pub fn decode(line: &str, mode: DecodeMode) -> Result<Option<Envelope>, ProtocolError> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return match mode {
            DecodeMode::Tolerant => Ok(None),
            DecodeMode::Strict => Err(ProtocolError::NotAMessage(snippet(trimmed))),
        };
    }

    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed {
            line: snippet(trimmed),
            reason: e.to_string(),
        })
}

fn snippet(line: &str) -> String {
    if line.len() <= SNIPPET_LEN {
        return line.to_string();
    }
    let mut end = SNIPPET_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all_variants() -> Vec<Message> {
        vec![
            Message::RequestJob,
            Message::RunJob {
                job: "spec/models/user_spec.rb".to_string(),
            },
            Message::Result {
                job: "features/login.feature".to_string(),
                output: "1) expected 2\n   got 3".to_string(),
            },
            Message::Ping,
            Message::WorkerReady,
            Message::Shutdown,
        ]
    }

    #[test]
    fn test_round_trip_every_variant() {
        for role in [Role::Master, Role::Worker, Role::Runner] {
            for message in all_variants() {
                let envelope = Envelope::new(role, message);
                let line = encode(&envelope).unwrap();
                let decoded = decode(&line, DecodeMode::Strict).unwrap().unwrap();
                assert_eq!(decoded, envelope);
            }
        }
    }

    #[test]
    fn test_encoded_record_shape() {
        let envelope = Envelope::new(
            Role::Master,
            Message::RunJob {
                job: "a_spec.rb".to_string(),
            },
        );
        let line = encode(&envelope).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["from"], "master");
        assert_eq!(value["type"], "run_job");
        assert_eq!(value["job"], "a_spec.rb");
    }

    #[test]
    fn test_unit_variant_record_shape() {
        let line = encode(&Envelope::new(Role::Runner, Message::RequestJob)).unwrap();
        assert_eq!(line, r#"{"from":"runner","type":"request_job"}"#);
    }

    #[test]
    fn test_multiline_output_stays_on_one_line() {
        let envelope = Envelope::new(
            Role::Worker,
            Message::Result {
                job: "x".to_string(),
                output: "line one\nline two\r\n\ttabbed".to_string(),
            },
        );
        let line = encode(&envelope).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(decode(&line, DecodeMode::Strict).unwrap().unwrap(), envelope);
    }

    #[test]
    fn test_noise_is_ignored_in_tolerant_mode() {
        for line in ["echo connected", "connected", "", "   ", "mkdir -p /tmp/work", "$ cd x"] {
            assert!(decode(line, DecodeMode::Tolerant).unwrap().is_none());
        }
    }

    #[test]
    fn test_noise_is_an_error_in_strict_mode() {
        let err = decode("Last login: Mon Oct 19", DecodeMode::Strict).unwrap_err();
        assert!(matches!(err, ProtocolError::NotAMessage(_)));
    }

    #[test]
    fn test_leading_whitespace_and_pty_carriage_return() {
        let line = "  {\"from\":\"worker\",\"type\":\"ping\"}\r";
        let decoded = decode(line, DecodeMode::Tolerant).unwrap().unwrap();
        assert_eq!(decoded, Envelope::new(Role::Worker, Message::Ping));
    }

    #[test]
    fn test_unknown_discriminant_is_malformed() {
        let err = decode(r#"{"from":"worker","type":"explode"}"#, DecodeMode::Tolerant)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_unknown_role_is_malformed() {
        let err = decode(r#"{"from":"nobody","type":"ping"}"#, DecodeMode::Tolerant)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let err = decode(r#"{"from":"master","type":"run_job"}"#, DecodeMode::Tolerant)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_truncated_record_is_malformed() {
        let err = decode(r#"{"from":"master","type":"run_j"#, DecodeMode::Tolerant).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_malformed_snippet_is_truncated_on_char_boundary() {
        let long = format!("{{{}", "é".repeat(200));
        match decode(&long, DecodeMode::Tolerant).unwrap_err() {
            ProtocolError::Malformed { line, .. } => {
                assert!(line.ends_with("..."));
                assert!(line.len() <= SNIPPET_LEN + 3);
            }
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_message_kind_names_match_wire_discriminants() {
        for message in all_variants() {
            let line = encode(&Envelope::new(Role::Master, message.clone())).unwrap();
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["type"], message.kind());
        }
    }

    proptest! {
        #[test]
        fn prop_result_round_trips(job in ".*", output in ".*") {
            let envelope = Envelope::new(Role::Worker, Message::Result { job, output });
            let line = encode(&envelope).unwrap();
            prop_assert!(!line.contains('\n'));
            prop_assert_eq!(decode(&line, DecodeMode::Strict).unwrap().unwrap(), envelope);
        }
    }
}
