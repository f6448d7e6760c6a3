//! Relation analysis: propose join keys across stored steps.
//!
//! Advisory pre-pass before synthesis. Name-based candidates are computed
//! locally and offered to the model for confirmation and normalization;
//! any failure here degrades synthesis, it never fails the process.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent::core::AgentCore;
use crate::agent::prompts::AgentPrompts;
use crate::error::AgentError;
use crate::library::CodeLibrary;
use crate::message::Message;

/// One proposed join between two stored steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinProposal {
    pub from_step: usize,
    pub from_column: String,
    pub to_step: usize,
    pub to_column: String,
}

/// Normalized relationship graph consumed by the coding prompt.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelationGraph {
    #[serde(default)]
    pub joins: Vec<JoinProposal>,
    #[serde(default)]
    pub notes: String,
}

impl RelationGraph {
    pub fn render(&self) -> String {
        if self.joins.is_empty() {
            return "(steps are independent; no joins proposed)".to_string();
        }
        let mut out = String::new();
        for join in &self.joins {
            out.push_str(&format!(
                "step_{}.{} ↔ step_{}.{}\n",
                join.from_step, join.from_column, join.to_step, join.to_column
            ));
        }
        if !self.notes.is_empty() {
            out.push_str(&format!("notes: {}\n", self.notes));
        }
        out
    }
}

/// Name-based join candidates: `x_id ↔ id` across steps and exact column
/// name matches on id-ish columns.
pub fn candidate_joins(library: &CodeLibrary) -> Vec<JoinProposal> {
    let steps = library.list();
    let mut candidates = Vec::new();
    for a in &steps {
        for b in &steps {
            if a.step_id >= b.step_id {
                continue;
            }
            for col_a in &a.column_schema {
                for col_b in &b.column_schema {
                    if is_join_pair(&col_a.name, &col_b.name) {
                        candidates.push(JoinProposal {
                            from_step: a.step_id,
                            from_column: col_a.name.clone(),
                            to_step: b.step_id,
                            to_column: col_b.name.clone(),
                        });
                    }
                }
            }
        }
    }
    candidates
}

fn is_join_pair(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    if a == b {
        return a == "id" || a.ends_with("_id");
    }
    // user_id ↔ id, group_id ↔ id, …
    (a.ends_with("_id") && b == "id") || (b.ends_with("_id") && a == "id")
}

/// Runs the analysis over the stored steps. Errors are the caller's cue to
/// degrade with a warning, not to abort.
pub async fn analyze(
    core: &AgentCore,
    prompts: &AgentPrompts,
    library: &CodeLibrary,
) -> Result<RelationGraph, AgentError> {
    if library.len() < 2 {
        return Ok(RelationGraph::default());
    }

    let steps_view: Vec<_> = library
        .list()
        .iter()
        .map(|s| {
            json!({
                "step_id": s.step_id,
                "kind": s.kind.as_str(),
                "description": s.description,
                "columns": s.column_schema,
                "sample_row": s.sample_rows.first(),
            })
        })
        .collect();
    let candidates = candidate_joins(library);

    let messages = vec![
        Message::system(prompts.relation.clone()),
        Message::user(format!(
            "Stored steps:\n{}\n\nName-based candidates (verify against the samples):\n{}",
            serde_json::to_string_pretty(&steps_view).unwrap_or_default(),
            serde_json::to_string(&candidates).unwrap_or_default(),
        )),
    ];

    let mut graph: RelationGraph = core.call_structured(messages).await?;
    let max_step = library.len();
    graph
        .joins
        .retain(|j| j.from_step >= 1 && j.from_step <= max_step && j.to_step >= 1 && j.to_step <= max_step);
    Ok(graph)
}
