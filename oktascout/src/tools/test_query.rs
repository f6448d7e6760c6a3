//! `execute_test_query`: run a candidate artifact under preview bounds.
//!
//! SQL artifacts go through the safety guard and the in-process executor;
//! API and API_SQL artifacts run in the sandbox child. Either way the model
//! only sees a one-row preview; the full capped result waits on the context
//! for `store_validated_step`.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use process_event::{RateLimitInfo, StepStatus, StepStatusUpdate};

use crate::library::StepKind;
use crate::sandbox::{ExecutionRequest, SandboxFailure, SandboxProgress};
use crate::schema::SqlExecError;
use crate::sqlguard::validate_sql;

use super::{
    infer_columns, parse_args, result_to_rows, ExecutionArtifact, Tool, ToolCallContext,
    ToolError, ToolSpec,
};

/// Attempts per call when Okta keeps rate-limiting the artifact.
const RATE_LIMIT_ATTEMPTS: u32 = 3;
/// Ceiling on how long a single back-off sleep may take.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TestQueryArgs {
    code: String,
    /// `API`, `SQL` or `API_SQL`.
    kind: String,
    /// Preview row budget; clamped to the configured preview cap.
    #[serde(default)]
    limit: Option<usize>,
}

pub struct ExecuteTestQueryTool;

#[async_trait]
impl Tool for ExecuteTestQueryTool {
    fn name(&self) -> &str {
        "execute_test_query"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: Some(
                "Execute a candidate step under strict preview bounds (row cap, byte cap, \
                 wall-clock deadline). Returns a one-row preview; call store_validated_step \
                 to keep the full validated result."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string" },
                    "kind": { "type": "string", "enum": ["API", "SQL", "API_SQL"] },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["code", "kind"],
                "additionalProperties": false
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let args: TestQueryArgs = parse_args(args)?;
        let kind: StepKind = args
            .kind
            .parse()
            .map_err(ToolError::InvalidArguments)?;
        let preview_cap = ctx.settings.preview_cap;
        let preview_limit = args.limit.unwrap_or(preview_cap).clamp(1, preview_cap);

        let (code, rows, column_schema, execution_ms, warnings) = match kind {
            StepKind::Sql => execute_sql(ctx, &args.code, preview_limit).await?,
            StepKind::Api | StepKind::ApiSql => {
                execute_in_sandbox(ctx, kind, &args.code, preview_limit).await?
            }
        };

        let record_count = rows.len() as u64;
        let sample_preview = preview_of(rows.first(), ctx.settings.preview_max_bytes);
        ctx.stash_execution(ExecutionArtifact {
            kind,
            code: code.clone(),
            rows,
            column_schema: column_schema.clone(),
            record_count,
            execution_ms,
        });

        let mut view = json!({
            "success": true,
            "kind": kind.as_str(),
            "sample_preview": sample_preview,
            "column_schema": column_schema,
            "record_count": record_count,
            "execution_ms": execution_ms,
            "note": "full results retained for storage; call store_validated_step to keep this step",
        });
        if !warnings.is_empty() {
            view["warnings"] = json!(warnings);
        }
        Ok(view)
    }
}

async fn execute_sql(
    ctx: &ToolCallContext,
    code: &str,
    preview_limit: usize,
) -> Result<(String, Vec<Value>, Vec<crate::schema::ColumnMeta>, u64, Vec<String>), ToolError> {
    let validated = validate_sql(code, ctx.settings.sql_row_cap)?;
    let rowset = ctx
        .sql
        .query(&validated.normalized_sql, Some(preview_limit))
        .await
        .map_err(|e| match e {
            SqlExecError::Timeout(d) => ToolError::Sandbox(SandboxFailure::Timeout(d)),
            other => ToolError::Sandbox(SandboxFailure::Runtime(other.to_string())),
        })?;
    Ok((
        validated.normalized_sql,
        rowset.rows,
        rowset.columns,
        rowset.execution_ms,
        validated.warnings,
    ))
}

async fn execute_in_sandbox(
    ctx: &ToolCallContext,
    kind: StepKind,
    code: &str,
    preview_limit: usize,
) -> Result<(String, Vec<Value>, Vec<crate::schema::ColumnMeta>, u64, Vec<String>), ToolError> {
    let mut variables = serde_json::Map::new();
    for step in ctx.library.list() {
        variables.insert(
            format!("step_{}", step.step_id),
            Value::Array(step.sample_rows.clone()),
        );
    }
    let request = ExecutionRequest {
        code: code.to_string(),
        variables,
        limit: Some(preview_limit),
        okta_org_url: ctx.settings.okta_org_url.clone(),
        okta_api_token: ctx.settings.okta_api_token.clone(),
        db_path: match kind {
            StepKind::ApiSql => ctx.settings.okta_db_path.display().to_string(),
            _ => String::new(),
        },
    };

    let step_index = ctx.step_index();
    let mut attempt = 1u32;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        let (progress_tx, progress_rx) = mpsc::channel::<SandboxProgress>(16);
        let forwarder = spawn_progress_forwarder(ctx, step_index, progress_rx);

        let outcome = ctx
            .sandbox
            .execute(
                &request,
                ctx.settings.step_execution_timeout,
                Some(progress_tx),
                &ctx.cancel,
            )
            .await;
        forwarder.abort();

        match outcome {
            Ok(outcome) => {
                let rows = result_to_rows(outcome.result);
                let columns = infer_columns(&rows);
                return Ok((
                    code.to_string(),
                    rows,
                    columns,
                    outcome.execution_ms,
                    Vec::new(),
                ));
            }
            Err(SandboxFailure::RateLimited { wait_seconds })
                if attempt < RATE_LIMIT_ATTEMPTS =>
            {
                debug!(attempt, wait_seconds, "rate limited, backing off");
                ctx.emit_step_update(StepStatusUpdate {
                    step_index,
                    status: Some(StepStatus::Running),
                    operation_status: Some("rate_limited".into()),
                    rate_limit_info: Some(RateLimitInfo { wait_seconds }),
                    ..Default::default()
                });
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                let backoff = Duration::from_secs(wait_seconds).min(MAX_BACKOFF) + jitter;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                attempt += 1;
            }
            Err(failure) => return Err(failure.into()),
        }
    }
}

fn spawn_progress_forwarder(
    ctx: &ToolCallContext,
    step_index: usize,
    mut progress_rx: mpsc::Receiver<SandboxProgress>,
) -> tokio::task::JoinHandle<()> {
    let events = ctx.events.clone();
    tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            let _ = events.try_send(process_event::ProcessEvent::StepStatusUpdate(
                StepStatusUpdate {
                    step_index,
                    status: Some(StepStatus::Running),
                    subprocess_progress_percent: Some(progress.percent),
                    subprocess_progress_details: Some(progress.message),
                    ..Default::default()
                },
            ));
        }
    })
}

/// One-row preview, truncated to the byte cap.
fn preview_of(row: Option<&Value>, max_bytes: usize) -> Value {
    let Some(row) = row else {
        return Value::Null;
    };
    let rendered = row.to_string();
    if rendered.len() <= max_bytes {
        row.clone()
    } else {
        let clipped: String = rendered.chars().take(max_bytes).collect();
        Value::String(format!("{clipped}…(truncated)"))
    }
}
