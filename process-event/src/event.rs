//! Event taxonomy for one process: wire shape is `type` tag + payload.
//!
//! Structural events (plan, phase, step list, step status transitions, final
//! result, error, cancel) must never be dropped by a bus; progress-only
//! updates may be collapsed latest-wins. [`ProcessEvent::is_structural`] and
//! [`ProcessEvent::collapse_key`] encode that split so the bus does not need
//! to inspect payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse phase of a process, carried by `phase_update`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Executing,
    Finalizing,
}

/// Status of one rendered step, carried by `step_status_update`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Error,
}

/// Payload of `plan_status`: either the initial plan snapshot or a bare
/// execution-status transition. Both fields optional so one shape covers
/// `{plan_details: {...}}` and `{status: "starting_execution"}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanStatusPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One entry of the flattened step list the UI renders (`step_plan_info`).
/// Includes synthetic steps (`thinking`, `generating_steps`,
/// `RELATIONSHIP_ANALYSIS`, `finalizing_results`) alongside execution steps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannedStepInfo {
    pub step_index: usize,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

/// Rate-limit hint surfaced on the stream when the sandbox backs off.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    #[serde(rename = "waitSeconds")]
    pub wait_seconds: u64,
}

/// Per-step status payload. Field casing matches the client contract: the
/// identifying fields are snake_case, the progress/accounting extras are
/// camelCase.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepStatusUpdate {
    pub step_index: usize,
    pub status: Option<StepStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(
        rename = "subprocessProgressPercent",
        skip_serializing_if = "Option::is_none"
    )]
    pub subprocess_progress_percent: Option<u8>,
    #[serde(
        rename = "subprocessProgressDetails",
        skip_serializing_if = "Option::is_none"
    )]
    pub subprocess_progress_details: Option<String>,
    #[serde(rename = "rateLimitInfo", skip_serializing_if = "Option::is_none")]
    pub rate_limit_info: Option<RateLimitInfo>,
    #[serde(rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(rename = "recordCount", skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(rename = "inputTokens", skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(rename = "outputTokens", skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepStatusUpdate {
    /// A running update that only carries subprocess progress; these are the
    /// only step updates a bus may collapse.
    pub fn is_progress_only(&self) -> bool {
        matches!(self.status, None | Some(StepStatus::Running))
            && self.subprocess_progress_percent.is_some()
            && self.result_summary.is_none()
            && self.error_message.is_none()
            && self.duration_ms.is_none()
    }
}

/// How the client should render `final_result.formatted_response.content`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    Markdown,
    Table,
    Json,
}

/// One table header: display text + row key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableHeader {
    pub text: String,
    pub value: String,
}

/// Metadata attached to a formatted final result.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<TableHeader>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub data_sources: Vec<String>,
}

/// User-facing final payload: content + display type + metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormattedResponse {
    pub content: Value,
    pub display_type: DisplayType,
    pub metadata: ResultMetadata,
}

/// One event on a process stream (wire shape: `type` tag + payload fields).
/// The envelope (`process_id`, `seq`, `ts`) is applied separately.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    PlanStatus(PlanStatusPayload),
    PhaseUpdate {
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    StepPlanInfo {
        steps: Vec<PlannedStepInfo>,
    },
    StepStatusUpdate(StepStatusUpdate),
    FinalResult {
        formatted_response: FormattedResponse,
        status: String,
    },
    PlanError {
        error_kind: String,
        message: String,
    },
    PlanCancelled,
}

impl ProcessEvent {
    /// Terminal events end the stream; nothing may be published after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessEvent::FinalResult { .. }
                | ProcessEvent::PlanError { .. }
                | ProcessEvent::PlanCancelled
        )
    }

    /// Structural events must survive bus overflow.
    pub fn is_structural(&self) -> bool {
        match self {
            ProcessEvent::StepStatusUpdate(u) => !u.is_progress_only(),
            _ => true,
        }
    }

    /// Collapse key for non-structural events: a newer event with the same
    /// key supersedes a buffered one (latest-wins). `None` for structural.
    pub fn collapse_key(&self) -> Option<u64> {
        match self {
            ProcessEvent::StepStatusUpdate(u) if u.is_progress_only() => {
                Some(u.step_index as u64)
            }
            _ => None,
        }
    }

    /// Serializes this event to a JSON object (type + payload only).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_status_serializes_client_field_names() {
        let ev = ProcessEvent::StepStatusUpdate(StepStatusUpdate {
            step_index: 2,
            status: Some(StepStatus::Running),
            subprocess_progress_percent: Some(40),
            rate_limit_info: Some(RateLimitInfo { wait_seconds: 13 }),
            ..Default::default()
        });
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "step_status_update");
        assert_eq!(v["step_index"], 2);
        assert_eq!(v["status"], "running");
        assert_eq!(v["subprocessProgressPercent"], 40);
        assert_eq!(v["rateLimitInfo"]["waitSeconds"], 13);
        assert!(v.get("result_summary").is_none());
    }

    #[test]
    fn progress_only_updates_are_collapsible() {
        let progress = ProcessEvent::StepStatusUpdate(StepStatusUpdate {
            step_index: 1,
            status: Some(StepStatus::Running),
            subprocess_progress_percent: Some(10),
            subprocess_progress_details: Some("page 2/20".into()),
            ..Default::default()
        });
        assert!(!progress.is_structural());
        assert_eq!(progress.collapse_key(), Some(1));

        let transition = ProcessEvent::StepStatusUpdate(StepStatusUpdate {
            step_index: 1,
            status: Some(StepStatus::Completed),
            duration_ms: Some(1200),
            ..Default::default()
        });
        assert!(transition.is_structural());
        assert_eq!(transition.collapse_key(), None);
    }

    #[test]
    fn terminal_classification() {
        assert!(ProcessEvent::PlanCancelled.is_terminal());
        assert!(ProcessEvent::PlanError {
            error_kind: "budget_exhausted".into(),
            message: "turn budget hit".into()
        }
        .is_terminal());
        let phase = ProcessEvent::PhaseUpdate {
            phase: Phase::Executing,
            warning: None,
        };
        assert!(!phase.is_terminal());
        assert!(phase.is_structural());
    }

    #[test]
    fn final_result_round_trips() {
        let ev = ProcessEvent::FinalResult {
            formatted_response: FormattedResponse {
                content: serde_json::json!([{"n": 42}]),
                display_type: DisplayType::Table,
                metadata: ResultMetadata {
                    headers: Some(vec![TableHeader {
                        text: "n".into(),
                        value: "n".into(),
                    }]),
                    total: Some(1),
                    data_sources: vec!["database".into()],
                },
            },
            status: "completed".into(),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "final_result");
        assert_eq!(v["formatted_response"]["display_type"], "table");
        assert_eq!(v["formatted_response"]["metadata"]["total"], 1);
        let back: ProcessEvent = serde_json::from_value(v).unwrap();
        assert!(back.is_terminal());
    }
}
