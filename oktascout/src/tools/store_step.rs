//! `store_validated_step` and `list_stored_steps`.
//!
//! Storing consumes the execution artifact stashed by the last
//! `execute_test_query`, so the full payload moves library-ward without ever
//! having been in the transcript. A `results` argument is accepted as a
//! fallback for models that re-send data, but the stashed artifact wins
//! whenever the code matches.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::library::{StepDraft, StepKind};

use super::{infer_columns, parse_args, result_to_rows, Tool, ToolCallContext, ToolError, ToolSpec};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StoreArgs {
    description: String,
    code: String,
    reasoning: String,
    /// Optional override when no matching execution artifact is stashed.
    #[serde(default)]
    results: Option<Value>,
    /// Step kind; only needed with `results`, otherwise taken from the
    /// stashed artifact.
    #[serde(default)]
    kind: Option<String>,
}

pub struct StoreValidatedStepTool;

#[async_trait]
impl Tool for StoreValidatedStepTool {
    fn name(&self) -> &str {
        "store_validated_step"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: Some(
                "Persist the last successfully executed step (code + validated results) into \
                 the code library for final synthesis. Call immediately after a successful \
                 execute_test_query."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "description": { "type": "string" },
                    "code": { "type": "string" },
                    "reasoning": { "type": "string" },
                    "results": {},
                    "kind": { "type": "string", "enum": ["API", "SQL", "API_SQL"] }
                },
                "required": ["description", "code", "reasoning"],
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let args: StoreArgs = parse_args(args)?;

        let stashed = {
            let stash = ctx.last_execution.lock().unwrap();
            stash
                .as_ref()
                .filter(|artifact| artifact.code == args.code)
                .cloned()
        };

        let draft = match (stashed, args.results) {
            (Some(artifact), _) => {
                ctx.take_last_execution();
                StepDraft {
                    kind: artifact.kind,
                    code: artifact.code,
                    description: args.description,
                    reasoning: args.reasoning,
                    sample_rows: artifact.rows,
                    column_schema: artifact.column_schema,
                    record_count_observed: artifact.record_count,
                    execution_ms: artifact.execution_ms,
                }
            }
            (None, Some(results)) => {
                let kind: StepKind = args
                    .kind
                    .as_deref()
                    .ok_or_else(|| {
                        ToolError::InvalidArguments(
                            "`kind` is required when storing explicit results".into(),
                        )
                    })?
                    .parse()
                    .map_err(ToolError::InvalidArguments)?;
                // Library invariant: every stored SQL string passed the
                // guard. The stash path stored validated code already; this
                // path has to validate here.
                let code = if kind == StepKind::Sql {
                    crate::sqlguard::validate_sql(&args.code, ctx.settings.sql_row_cap)?
                        .normalized_sql
                } else {
                    args.code
                };
                let rows = result_to_rows(results);
                let column_schema = infer_columns(&rows);
                StepDraft {
                    kind,
                    code,
                    description: args.description,
                    reasoning: args.reasoning,
                    record_count_observed: rows.len() as u64,
                    sample_rows: rows,
                    column_schema,
                    execution_ms: 0,
                }
            }
            (None, None) => {
                return Err(ToolError::InvalidArguments(
                    "no validated execution matches this code; run execute_test_query first"
                        .into(),
                ))
            }
        };

        let (step_id, total_steps) = ctx
            .library
            .append(draft, chrono::Utc::now().to_rfc3339())?;
        Ok(json!({
            "success": true,
            "step_id": step_id,
            "total_steps": total_steps,
        }))
    }
}

/// Lists stored step summaries. No arguments.
pub struct ListStoredStepsTool;

#[async_trait]
impl Tool for ListStoredStepsTool {
    fn name(&self) -> &str {
        "list_stored_steps"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: Some(
                "List steps already stored in the code library (id, kind, description, \
                 columns, record count)."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, _args: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let summaries = ctx.library.summaries();
        Ok(json!({
            "success": true,
            "total_steps": summaries.len(),
            "steps": summaries,
        }))
    }
}
