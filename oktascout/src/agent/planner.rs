//! Planner: one reasoning call that turns the user query into an advisory
//! plan.
//!
//! The planner fails open: malformed output after the reparse budget yields
//! an empty plan and execution proceeds on the user query alone. Only a
//! failed provider call propagates as an error.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::core::AgentCore;
use crate::agent::prompts::AgentPrompts;
use crate::error::AgentError;
use crate::library::StepKind;
use crate::message::Message;

/// One advisory step of the plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    #[serde(with = "step_kind_str")]
    pub tool_kind: StepKind,
    pub entity: String,
    pub operation: String,
    pub query_context: String,
    #[serde(default)]
    pub critical: bool,
}

/// Ordered plan plus free-text strategy; read-only after planning.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Compact rendering for the ReAct transcript and `plan_status`.
    pub fn render(&self) -> String {
        if self.steps.is_empty() {
            return "(no plan; proceed from the question alone)".to_string();
        }
        let mut out = format!("Strategy: {}\n", self.strategy);
        for step in &self.steps {
            out.push_str(&format!(
                "{}. [{}] {} — {} ({})\n",
                step.index,
                step.tool_kind.as_str(),
                step.entity,
                step.operation,
                step.query_context
            ));
        }
        out
    }

    /// Step summaries for the `plan_status` payload.
    pub fn steps_summary(&self) -> Vec<serde_json::Value> {
        self.steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "index": s.index,
                    "tool_kind": s.tool_kind.as_str(),
                    "entity": s.entity,
                    "operation": s.operation,
                })
            })
            .collect()
    }
}

mod step_kind_str {
    use super::StepKind;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(kind: &StepKind, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(kind.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<StepKind, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Runs the planner. `history` carries prior conversation turns when the
/// query continues an earlier exchange.
pub async fn plan(
    core: &AgentCore,
    prompts: &AgentPrompts,
    user_query: &str,
    catalog_summary: &str,
    schema_summary: &str,
    history: &[Message],
) -> Result<Plan, AgentError> {
    let mut messages = vec![Message::system(format!(
        "{}\n\nAvailable read-only API operations:\n{}\n\nSnapshot tables:\n{}",
        prompts.planner, catalog_summary, schema_summary
    ))];
    messages.extend_from_slice(history);
    messages.push(Message::user(user_query.to_string()));

    match core.call_structured::<Plan>(messages).await {
        Ok(mut plan) => {
            // Re-index defensively so downstream rendering is stable.
            for (i, step) in plan.steps.iter_mut().enumerate() {
                step.index = i + 1;
            }
            info!(steps = plan.steps.len(), "plan generated");
            Ok(plan)
        }
        Err(AgentError::StructuredOutput(reason)) => {
            warn!(%reason, "planner output unusable, proceeding with empty plan");
            Ok(Plan::default())
        }
        Err(other) => Err(other),
    }
}
