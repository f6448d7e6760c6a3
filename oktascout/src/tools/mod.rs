//! The closed tool surface offered to the ReAct agent.
//!
//! Each tool is a [`Tool`] with a JSON-schema argument contract; the
//! registry is a value-typed table keyed by name and handed to the agent at
//! construction. Tools see one process through [`ToolCallContext`]: the code
//! library, catalog, schema view, executors, the event sender and the
//! cancellation token. Nothing here can mutate the user query or earlier
//! steps.
//!
//! The preview-vs-store split lives in this module: `execute_test_query`
//! returns a one-row preview to the model and stashes the full capped
//! result as an [`ExecutionArtifact`] on the context; only
//! `store_validated_step` moves that artifact into the library.

mod endpoints;
mod finalize;
mod sql_schema;
mod store_step;
mod test_query;

pub use endpoints::{FilterEndpointsTool, LoadReadEndpointsTool};
pub use finalize::{SynthesizeFinalScriptTool, SYNTHESIZE_FINAL_SCRIPT};
pub use sql_schema::LoadSqlSchemaTool;
pub use store_step::{ListStoredStepsTool, StoreValidatedStepTool};
pub use test_query::ExecuteTestQueryTool;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use process_event::{ProcessEvent, StepStatusUpdate};

use crate::catalog::ApiCatalog;
use crate::config::Settings;
use crate::error::ErrorKind;
use crate::ledger::{TokenLedger, ToolCallRecord};
use crate::library::{CodeLibrary, LibraryError, StepKind};
use crate::sandbox::{SandboxExecutor, SandboxFailure};
use crate::schema::{ColumnMeta, SchemaView, SqlExecutor};
use crate::sqlguard::SqlGuardError;

/// Tool metadata shown to the model: name, description, argument schema.
#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Validated result of the latest `execute_test_query`, pending storage.
/// This is the "full results for storage" payload: it never enters the
/// transcript.
#[derive(Clone, Debug)]
pub struct ExecutionArtifact {
    pub kind: StepKind,
    pub code: String,
    pub rows: Vec<Value>,
    pub column_schema: Vec<ColumnMeta>,
    pub record_count: u64,
    pub execution_ms: u64,
}

/// Per-process context injected into every tool call.
pub struct ToolCallContext {
    pub settings: Arc<Settings>,
    pub catalog: ApiCatalog,
    pub schema: SchemaView,
    pub library: Arc<CodeLibrary>,
    pub ledger: Arc<TokenLedger>,
    pub sql: Arc<SqlExecutor>,
    pub sandbox: Arc<SandboxExecutor>,
    /// Step-status events emitted mid-call (progress, rate-limit hints).
    /// Send is lossy; the bus collapses progress anyway.
    pub events: mpsc::Sender<ProcessEvent>,
    pub cancel: CancellationToken,
    /// UI index of the step currently executing; set by the ReAct loop.
    pub current_step_index: std::sync::atomic::AtomicUsize,
    /// Stash for the preview-vs-store split.
    pub last_execution: Mutex<Option<ExecutionArtifact>>,
    /// Description passed to `synthesize_final_script`, read by the
    /// synthesis phase after the loop ends.
    pub final_request: Mutex<Option<String>>,
}

impl ToolCallContext {
    pub fn step_index(&self) -> usize {
        self.current_step_index
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_step_index(&self, index: usize) {
        self.current_step_index
            .store(index, std::sync::atomic::Ordering::Relaxed)
    }

    /// Emits a step status update for the current step; drops on back-pressure.
    pub fn emit_step_update(&self, update: StepStatusUpdate) {
        let _ = self.events.try_send(ProcessEvent::StepStatusUpdate(update));
    }

    pub fn take_last_execution(&self) -> Option<ExecutionArtifact> {
        self.last_execution.lock().unwrap().take()
    }

    pub fn stash_execution(&self, artifact: ExecutionArtifact) {
        *self.last_execution.lock().unwrap() = Some(artifact);
    }

    /// Records a tool call into the process token ledger.
    pub fn ledger_record(&self, record: ToolCallRecord) {
        self.ledger.record_tool_call(record);
    }
}

/// Tool failure fed back to the model as a structured error (except
/// cancellation, which aborts the loop).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    SqlRejected(#[from] SqlGuardError),
    #[error(transparent)]
    Sandbox(#[from] SandboxFailure),
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ToolError::InvalidArguments(_) | ToolError::UnknownTool(_) => {
                ErrorKind::ValidationError
            }
            ToolError::SqlRejected(_) => ErrorKind::SqlRejected,
            ToolError::Sandbox(f) => f.error_kind(),
            ToolError::Library(_) => ErrorKind::SandboxOversized,
            ToolError::Cancelled => ErrorKind::Cancelled,
            ToolError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// JSON view of the failure the model can reason about.
    pub fn to_model_view(&self) -> Value {
        serde_json::json!({
            "success": false,
            "error_kind": self.error_kind().as_str(),
            "reason": self.to_string(),
        })
    }
}

/// One tool: unique name, spec, call logic.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn spec(&self) -> ToolSpec;

    /// Executes with already-parsed JSON arguments. The returned value is
    /// exactly what the model sees next turn.
    async fn call(&self, args: Value, ctx: &ToolCallContext) -> Result<Value, ToolError>;
}

/// Value-typed tool table keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    /// The full closed surface in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.spec())
            .collect()
    }

    pub async fn call(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolCallContext,
    ) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.call(args, ctx).await
    }

    /// The standard surface for one process.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LoadReadEndpointsTool));
        registry.register(Arc::new(FilterEndpointsTool));
        registry.register(Arc::new(LoadSqlSchemaTool));
        registry.register(Arc::new(ExecuteTestQueryTool));
        registry.register(Arc::new(StoreValidatedStepTool));
        registry.register(Arc::new(ListStoredStepsTool));
        registry.register(Arc::new(SynthesizeFinalScriptTool));
        registry
    }
}

/// Parses tool arguments against a serde contract, mapping failures to
/// [`ToolError::InvalidArguments`] so the loop can feed them back.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Infers a column schema from JSON rows: keys of the first object row, or
/// a single `value` column for scalar results.
pub(crate) fn infer_columns(rows: &[Value]) -> Vec<ColumnMeta> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    match first {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| ColumnMeta {
                name: k.clone(),
                inferred_type: json_type_name(v).to_string(),
            })
            .collect(),
        other => vec![ColumnMeta {
            name: "value".into(),
            inferred_type: json_type_name(other).to_string(),
        }],
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "TEXT",
        Value::Bool(_) => "BOOLEAN",
        Value::Number(n) if n.is_i64() || n.is_u64() => "INTEGER",
        Value::Number(_) => "REAL",
        Value::String(_) => "TEXT",
        Value::Array(_) | Value::Object(_) => "JSON",
    }
}

/// Normalizes an artifact result into a row list: arrays as-is, a lone
/// object as one row, scalars wrapped.
pub(crate) fn result_to_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        object @ Value::Object(_) => vec![object],
        scalar => vec![serde_json::json!({ "value": scalar })],
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::govern::RateGovernor;
    use std::time::Duration;

    /// Context over a throwaway snapshot DB seeded with a few users.
    pub(crate) fn context_with_db() -> (ToolCallContext, tempfile::TempDir, mpsc::Receiver<ProcessEvent>) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("snap.db");
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE users (id TEXT PRIMARY KEY, login TEXT, status TEXT, created_at TEXT);
            INSERT INTO users VALUES
                ('u1', 'ada@example.com', 'ACTIVE', '2026-01-02T00:00:00Z'),
                ('u2', 'sam@example.com', 'LOCKED_OUT', '2026-02-10T00:00:00Z'),
                ('u3', 'kim@example.com', 'ACTIVE', '2026-03-05T00:00:00Z'),
                ('u4', 'lee@example.com', 'ACTIVE', '2026-04-01T00:00:00Z');
            "#,
        )
        .unwrap();

        let mut settings = Settings::default();
        settings.okta_db_path = db_path.clone();
        let settings = Arc::new(settings);
        let governor = Arc::new(RateGovernor::new(
            settings.api_concurrent_limit,
            settings.api_rate_per_second,
        ));
        let (events, events_rx) = mpsc::channel(64);
        let ctx = ToolCallContext {
            catalog: ApiCatalog::new(),
            schema: SchemaView::new(),
            library: Arc::new(CodeLibrary::new(
                settings.preview_cap,
                settings.max_stored_bytes_per_step,
            )),
            ledger: Arc::new(TokenLedger::new()),
            sql: Arc::new(SqlExecutor::new(
                &db_path,
                settings.sql_row_cap,
                Duration::from_secs(10),
            )),
            sandbox: Arc::new(SandboxExecutor::new(
                settings.sandbox_interpreter.clone(),
                settings.max_output_bytes,
                governor,
            )),
            events,
            cancel: CancellationToken::new(),
            current_step_index: std::sync::atomic::AtomicUsize::new(0),
            last_execution: Mutex::new(None),
            final_request: Mutex::new(None),
            settings,
        };
        (ctx, dir, events_rx)
    }
}
