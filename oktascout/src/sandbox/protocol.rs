//! JSON-line protocol between the host and the sandbox child.
//!
//! The host writes one [`ExecutionRequest`] line on the child's stdin, then
//! answers `acquire` frames with `grant` lines. The child writes
//! [`ChildFrame`] lines on stdout; user code's own stdout is buffered inside
//! the harness and never mixes with frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything the harness needs for one execution, sent as the first line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The candidate code artifact.
    pub code: String,
    /// Named inputs injected into the artifact's scope (e.g. `step_1`,
    /// `step_2` prior results).
    pub variables: serde_json::Map<String, Value>,
    /// Row cap the artifact should honor (`limit` in its scope); `None` for
    /// the unbounded final run.
    pub limit: Option<usize>,
    /// Okta host the artifact may call; the only allowed egress.
    pub okta_org_url: String,
    pub okta_api_token: String,
    /// Snapshot path opened read-only for the `db` handle; empty disables
    /// SQL access.
    pub db_path: String,
}

/// Frames emitted by the child, one JSON object per line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildFrame {
    /// Structured progress for the stream (percentage + message).
    Progress { percent: u8, message: String },
    /// Request for one HTTP permit; host answers with a `grant` line.
    Acquire,
    /// The HTTP call behind the last permit finished.
    Release,
    /// Okta told the artifact to back off; terminal for this execution.
    RateLimited { wait_seconds: u64 },
    /// The artifact completed and bound `result`.
    Result { value: Value },
    /// The artifact failed; `kind` distinguishes contract violations from
    /// plain runtime errors.
    Error {
        message: String,
        #[serde(default)]
        kind: Option<String>,
    },
}

/// Frames written by the host after the initial request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Grant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_frames_round_trip() {
        for (line, expected) in [
            (
                r#"{"type":"progress","percent":40,"message":"page 4/10"}"#,
                ChildFrame::Progress {
                    percent: 40,
                    message: "page 4/10".into(),
                },
            ),
            (r#"{"type":"acquire"}"#, ChildFrame::Acquire),
            (
                r#"{"type":"rate_limited","wait_seconds":13}"#,
                ChildFrame::RateLimited { wait_seconds: 13 },
            ),
        ] {
            let frame: ChildFrame = serde_json::from_str(line).unwrap();
            assert_eq!(frame, expected);
        }
    }

    #[test]
    fn error_frame_kind_is_optional() {
        let frame: ChildFrame =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(
            frame,
            ChildFrame::Error {
                message: "boom".into(),
                kind: None
            }
        );
    }

    #[test]
    fn grant_serializes_as_tagged_object() {
        assert_eq!(
            serde_json::to_string(&HostFrame::Grant).unwrap(),
            r#"{"type":"grant"}"#
        );
    }
}
