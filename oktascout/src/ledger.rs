//! Per-process token ledger.
//!
//! Every chat call is billed under a model profile; every tool call records
//! its own envelope (timings, status, tokens where a call involved the
//! model). The supervisor owns the ledger and drops it with the process.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::llm::{LlmUsage, Profile};

/// Terminal status of one tool call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Ok,
    Error,
    Timeout,
}

/// Record of one tool call, ordered by start time.
#[derive(Clone, Debug, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub started_at: String,
    pub ended_at: String,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ProfileTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

/// Point-in-time view of the ledger.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LedgerSnapshot {
    pub per_profile: HashMap<String, ProfileTotals>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

#[derive(Default)]
struct Inner {
    per_profile: HashMap<Profile, ProfileTotals>,
    tool_calls: Vec<ToolCallRecord>,
}

/// Thread-safe token accounting for one process.
#[derive(Default)]
pub struct TokenLedger {
    inner: Mutex<Inner>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_usage(&self, profile: Profile, usage: &LlmUsage) {
        let mut inner = self.inner.lock().unwrap();
        let totals = inner.per_profile.entry(profile).or_default();
        totals.input_tokens += usage.prompt_tokens as u64;
        totals.output_tokens += usage.completion_tokens as u64;
        totals.calls += 1;
    }

    pub fn record_tool_call(&self, record: ToolCallRecord) {
        self.inner.lock().unwrap().tool_calls.push(record);
    }

    /// Tokens billed so far under one profile (input, output).
    pub fn profile_totals(&self, profile: Profile) -> ProfileTotals {
        self.inner
            .lock()
            .unwrap()
            .per_profile
            .get(&profile)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut snapshot = LedgerSnapshot::default();
        for (profile, totals) in &inner.per_profile {
            snapshot
                .per_profile
                .insert(profile.as_str().to_string(), *totals);
            snapshot.total_input_tokens += totals.input_tokens;
            snapshot.total_output_tokens += totals.output_tokens;
        }
        snapshot.tool_calls = inner.tool_calls.clone();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u32, output: u32) -> LlmUsage {
        LlmUsage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
        }
    }

    #[test]
    fn sums_accumulate_per_profile() {
        let ledger = TokenLedger::new();
        ledger.record_usage(Profile::Reasoning, &usage(100, 20));
        ledger.record_usage(Profile::Reasoning, &usage(50, 10));
        ledger.record_usage(Profile::Coding, &usage(200, 80));

        let reasoning = ledger.profile_totals(Profile::Reasoning);
        assert_eq!(reasoning.input_tokens, 150);
        assert_eq!(reasoning.output_tokens, 30);
        assert_eq!(reasoning.calls, 2);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.total_input_tokens, 350);
        assert_eq!(snapshot.total_output_tokens, 110);
        assert_eq!(snapshot.per_profile["coding"].calls, 1);
    }

    #[test]
    fn tool_calls_keep_insertion_order() {
        let ledger = TokenLedger::new();
        for name in ["load_sql_schema", "execute_test_query"] {
            ledger.record_tool_call(ToolCallRecord {
                name: name.into(),
                arguments: serde_json::json!({}),
                started_at: "2026-01-01T00:00:00Z".into(),
                ended_at: "2026-01-01T00:00:01Z".into(),
                status: ToolCallStatus::Ok,
                error_kind: None,
                input_tokens: 0,
                output_tokens: 0,
            });
        }
        let names: Vec<_> = ledger
            .snapshot()
            .tool_calls
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(names, vec!["load_sql_schema", "execute_test_query"]);
    }
}
