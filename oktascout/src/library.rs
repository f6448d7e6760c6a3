//! Code library: append-only store of validated step artifacts for one
//! process.
//!
//! Steps are indexed by a monotonic `step_id` starting at 1; artifacts
//! reference earlier results as `step_N`, never by pointer. Everything here
//! is preview-sized: the library holds the capped sample, not the full
//! result set, and refuses payloads above the per-step byte budget so a
//! single store cannot blow the final-synthesis context.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use crate::schema::ColumnMeta;

/// Where a step's data came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Api,
    Sql,
    ApiSql,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Api => "API",
            StepKind::Sql => "SQL",
            StepKind::ApiSql => "API_SQL",
        }
    }

    pub fn data_sources(&self) -> &'static [&'static str] {
        match self {
            StepKind::Api => &["api"],
            StepKind::Sql => &["database"],
            StepKind::ApiSql => &["database", "api"],
        }
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "API" => Ok(StepKind::Api),
            "SQL" => Ok(StepKind::Sql),
            "API_SQL" => Ok(StepKind::ApiSql),
            other => Err(format!("unknown step kind: {other} (use API, SQL, API_SQL)")),
        }
    }
}

/// A validated artifact: its code executed successfully under the sandbox
/// before it was admitted here.
#[derive(Clone, Debug, Serialize)]
pub struct StoredStep {
    pub step_id: usize,
    pub kind: StepKind,
    pub code: String,
    pub description: String,
    pub reasoning: String,
    /// At most `preview_cap` rows.
    pub sample_rows: Vec<serde_json::Value>,
    pub column_schema: Vec<ColumnMeta>,
    pub record_count_observed: u64,
    pub execution_ms: u64,
    pub stored_at: String,
}

/// What `list_stored_steps` shows the model.
#[derive(Clone, Debug, Serialize)]
pub struct StepSummary {
    pub step_id: usize,
    pub kind: StepKind,
    pub description: String,
    pub column_schema: Vec<ColumnMeta>,
    pub record_count: u64,
}

/// Step content prior to admission (everything but the id and timestamp).
#[derive(Clone, Debug)]
pub struct StepDraft {
    pub kind: StepKind,
    pub code: String,
    pub description: String,
    pub reasoning: String,
    pub sample_rows: Vec<serde_json::Value>,
    pub column_schema: Vec<ColumnMeta>,
    pub record_count_observed: u64,
    pub execution_ms: u64,
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error(
        "step payload is {bytes} bytes, over the {limit} byte cap; store fewer sample rows or trim the code"
    )]
    Oversized { bytes: usize, limit: usize },
}

/// Per-process arena of stored steps. Append-only; ids are never reused.
pub struct CodeLibrary {
    steps: Mutex<Vec<Arc<StoredStep>>>,
    preview_cap: usize,
    max_stored_bytes: usize,
}

impl CodeLibrary {
    pub fn new(preview_cap: usize, max_stored_bytes: usize) -> Self {
        Self {
            steps: Mutex::new(Vec::new()),
            preview_cap,
            max_stored_bytes,
        }
    }

    /// Admits a draft: caps the sample, checks the byte budget, assigns the
    /// next `step_id`. Returns `(step_id, total_steps)`.
    pub fn append(&self, mut draft: StepDraft, stored_at: String) -> Result<(usize, usize), LibraryError> {
        draft.sample_rows.truncate(self.preview_cap);
        let bytes = self.measure(&draft);
        if bytes > self.max_stored_bytes {
            return Err(LibraryError::Oversized {
                bytes,
                limit: self.max_stored_bytes,
            });
        }
        let record_count_observed = draft
            .record_count_observed
            .max(draft.sample_rows.len() as u64);

        let mut steps = self.steps.lock().unwrap();
        let step_id = steps.len() + 1;
        steps.push(Arc::new(StoredStep {
            step_id,
            kind: draft.kind,
            code: draft.code,
            description: draft.description,
            reasoning: draft.reasoning,
            sample_rows: draft.sample_rows,
            column_schema: draft.column_schema,
            record_count_observed,
            execution_ms: draft.execution_ms,
            stored_at,
        }));
        Ok((step_id, steps.len()))
    }

    fn measure(&self, draft: &StepDraft) -> usize {
        let rows_bytes = draft
            .sample_rows
            .iter()
            .map(|r| r.to_string().len())
            .sum::<usize>();
        draft.code.len() + draft.description.len() + draft.reasoning.len() + rows_bytes
    }

    pub fn get(&self, step_id: usize) -> Option<Arc<StoredStep>> {
        let steps = self.steps.lock().unwrap();
        step_id
            .checked_sub(1)
            .and_then(|i| steps.get(i))
            .cloned()
    }

    /// All steps in append order.
    pub fn list(&self) -> Vec<Arc<StoredStep>> {
        self.steps.lock().unwrap().clone()
    }

    pub fn summaries(&self) -> Vec<StepSummary> {
        self.steps
            .lock()
            .unwrap()
            .iter()
            .map(|s| StepSummary {
                step_id: s.step_id,
                kind: s.kind,
                description: s.description.clone(),
                column_schema: s.column_schema.clone(),
                record_count: s.record_count_observed,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union of data sources across stored steps, in first-seen order.
    pub fn data_sources(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for step in self.steps.lock().unwrap().iter() {
            for source in step.kind.data_sources() {
                if !out.iter().any(|s| s == source) {
                    out.push((*source).to_string());
                }
            }
        }
        out
    }
}
