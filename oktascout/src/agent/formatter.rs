//! Results formatter: turn final data into a display payload.
//!
//! Small result sets become tables directly; aggregations pass through in
//! structured form; anything over the context budget is stratified-sampled
//! and summarized by the reasoning model with a sampling caveat. The model
//! is a fallback, not a dependency: if the summary call fails, the sampled
//! table ships instead.

use serde_json::Value;
use tracing::warn;

use process_event::{DisplayType, FormattedResponse, ResultMetadata, TableHeader};

use crate::agent::core::AgentCore;
use crate::agent::prompts::AgentPrompts;
use crate::message::Message;
use crate::tools;

/// Rows beyond this go through sampling + summary instead of a full table.
const TABLE_ROW_BUDGET: usize = 200;
/// Rows shown to the model (and shipped) when sampling.
const SAMPLE_SIZE: usize = 30;

pub async fn format_result(
    core: &AgentCore,
    prompts: &AgentPrompts,
    user_query: &str,
    result: Value,
    data_sources: Vec<String>,
) -> FormattedResponse {
    let rows = tools::result_to_rows(result);
    let total = rows.len() as u64;
    let headers = headers_of(&rows);

    if rows.is_empty() {
        return FormattedResponse {
            content: Value::String("The final script produced no rows.".into()),
            display_type: DisplayType::Markdown,
            metadata: ResultMetadata {
                headers: None,
                total: Some(0),
                data_sources,
            },
        };
    }

    // Aggregations (one row) and table-sized results pass through whole.
    if rows.len() <= TABLE_ROW_BUDGET {
        return FormattedResponse {
            content: Value::Array(rows),
            display_type: DisplayType::Table,
            metadata: ResultMetadata {
                headers: Some(headers),
                total: Some(total),
                data_sources,
            },
        };
    }

    let sample = stratified_sample(&rows, SAMPLE_SIZE);
    let summary_request = vec![
        Message::system(prompts.formatter.clone()),
        Message::user(format!(
            "Question: {user_query}\nTotal rows: {total}\nColumns: {}\n\
             Stratified sample ({} of {total} rows):\n{}",
            headers
                .iter()
                .map(|h| h.value.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            sample.len(),
            serde_json::to_string_pretty(&sample).unwrap_or_default(),
        )),
    ];

    match core.call(crate::llm::ChatRequest::text(summary_request)).await {
        Ok(response) if !response.content.is_empty() => FormattedResponse {
            content: Value::String(response.content),
            display_type: DisplayType::Markdown,
            metadata: ResultMetadata {
                headers: Some(headers),
                total: Some(total),
                data_sources,
            },
        },
        Ok(_) | Err(_) => {
            warn!("formatter summary unavailable, shipping sampled table");
            FormattedResponse {
                content: Value::Array(sample),
                display_type: DisplayType::Table,
                metadata: ResultMetadata {
                    headers: Some(headers),
                    total: Some(total),
                    data_sources,
                },
            }
        }
    }
}

/// Headers from the first row's keys (insertion order preserved).
fn headers_of(rows: &[Value]) -> Vec<TableHeader> {
    match rows.first() {
        Some(Value::Object(map)) => map
            .keys()
            .map(|k| TableHeader {
                text: k.clone(),
                value: k.clone(),
            })
            .collect(),
        Some(_) => vec![TableHeader {
            text: "value".into(),
            value: "value".into(),
        }],
        None => Vec::new(),
    }
}

/// Every k-th row, first row always included; preserves order.
fn stratified_sample(rows: &[Value], sample_size: usize) -> Vec<Value> {
    if rows.len() <= sample_size {
        return rows.to_vec();
    }
    let stride = rows.len().div_ceil(sample_size);
    rows.iter().step_by(stride).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TokenLedger;
    use crate::llm::{text_reply, MockChat, Profile, ScriptedTurn};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn core_with(script: Vec<ScriptedTurn>) -> AgentCore {
        AgentCore::new(
            Box::new(MockChat::new(script)),
            Profile::Reasoning,
            Arc::new(TokenLedger::new()),
            CancellationToken::new(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn aggregation_passes_through_as_a_table() {
        let response = format_result(
            &core_with(vec![]),
            &AgentPrompts::embedded(),
            "how many active users?",
            serde_json::json!([{"n": 42}]),
            vec!["database".into()],
        )
        .await;
        assert_eq!(response.display_type, DisplayType::Table);
        assert_eq!(response.content[0]["n"], 42);
        let metadata = response.metadata;
        assert_eq!(metadata.total, Some(1));
        assert_eq!(metadata.headers.unwrap()[0].value, "n");
        assert_eq!(metadata.data_sources, vec!["database"]);
    }

    #[tokio::test]
    async fn oversized_results_are_sampled_and_summarized() {
        let rows: Vec<Value> = (0..1000)
            .map(|i| serde_json::json!({"id": format!("u{i}"), "status": "ACTIVE"}))
            .collect();
        let response = format_result(
            &core_with(vec![ScriptedTurn::Reply(text_reply(
                "1000 active users; all sampled rows show status ACTIVE.",
            ))]),
            &AgentPrompts::embedded(),
            "list active users",
            Value::Array(rows),
            vec!["database".into()],
        )
        .await;
        assert_eq!(response.display_type, DisplayType::Markdown);
        assert_eq!(response.metadata.total, Some(1000));
        assert!(response.content.as_str().unwrap().contains("1000"));
    }

    #[tokio::test]
    async fn summary_failure_falls_back_to_a_sampled_table() {
        let rows: Vec<Value> = (0..500).map(|i| serde_json::json!({"id": i})).collect();
        let response = format_result(
            &core_with(vec![ScriptedTurn::Fail("provider down".into())]),
            &AgentPrompts::embedded(),
            "q",
            Value::Array(rows),
            vec!["api".into()],
        )
        .await;
        assert_eq!(response.display_type, DisplayType::Table);
        let shipped = response.content.as_array().unwrap();
        assert!(shipped.len() <= SAMPLE_SIZE + 1);
        assert_eq!(response.metadata.total, Some(500));
    }

    #[test]
    fn sample_keeps_first_row_and_order() {
        let rows: Vec<Value> = (0..100).map(|i| serde_json::json!(i)).collect();
        let sample = stratified_sample(&rows, 10);
        assert!(sample.len() <= 10 + 1);
        assert_eq!(sample[0], serde_json::json!(0));
        let values: Vec<i64> = sample.iter().map(|v| v.as_i64().unwrap()).collect();
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(values, sorted);
    }

    #[tokio::test]
    async fn empty_results_render_as_markdown_notice() {
        let response = format_result(
            &core_with(vec![]),
            &AgentPrompts::embedded(),
            "q",
            Value::Array(vec![]),
            vec!["database".into()],
        )
        .await;
        assert_eq!(response.display_type, DisplayType::Markdown);
        assert_eq!(response.metadata.total, Some(0));
    }
}
