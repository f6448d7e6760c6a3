//! Final script synthesis: a coding-profile call over the stored steps.
//!
//! The produced artifact runs without probe limits; the caller either emits
//! it to the client or executes it in the sandbox under the final-step
//! deadline.

use serde_json::json;

use crate::agent::core::{strip_code_fence, AgentCore};
use crate::agent::prompts::AgentPrompts;
use crate::agent::relation::RelationGraph;
use crate::error::AgentError;
use crate::library::CodeLibrary;
use crate::message::Message;

/// The synthesized artifact.
#[derive(Clone, Debug)]
pub struct FinalScript {
    pub code: String,
    pub description: String,
}

pub async fn synthesize(
    core: &AgentCore,
    prompts: &AgentPrompts,
    user_query: &str,
    description: &str,
    library: &CodeLibrary,
    relation: Option<&RelationGraph>,
) -> Result<FinalScript, AgentError> {
    let steps_view: Vec<_> = library
        .list()
        .iter()
        .map(|s| {
            json!({
                "step_id": s.step_id,
                "kind": s.kind.as_str(),
                "description": s.description,
                "reasoning": s.reasoning,
                "code": s.code,
                "columns": s.column_schema,
                "sample_rows": s.sample_rows,
                "record_count_observed": s.record_count_observed,
            })
        })
        .collect();

    let relation_block = match relation {
        Some(graph) => format!("Join graph:\n{}", graph.render()),
        None => "Join graph: unavailable (analysis failed); join by matching id columns \
                 where the samples support it."
            .to_string(),
    };

    let messages = vec![
        Message::system(prompts.coding.clone()),
        Message::user(format!(
            "Question: {user_query}\n\nGoal for the final script: {description}\n\n\
             Validated steps:\n{}\n\n{relation_block}",
            serde_json::to_string_pretty(&steps_view).unwrap_or_default(),
        )),
    ];

    let response = core.call(crate::llm::ChatRequest::text(messages)).await?;
    let code = strip_code_fence(&response.content).trim().to_string();
    if code.is_empty() {
        return Err(AgentError::StructuredOutput(
            "coding model returned an empty script".into(),
        ));
    }
    Ok(FinalScript {
        code,
        description: description.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TokenLedger;
    use crate::library::{StepDraft, StepKind};
    use crate::llm::{text_reply, MockChat, Profile, ScriptedTurn};
    use crate::schema::ColumnMeta;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn library_with_one_step() -> CodeLibrary {
        let library = CodeLibrary::new(3, 1 << 20);
        library
            .append(
                StepDraft {
                    kind: StepKind::Sql,
                    code: "SELECT count(*) AS n FROM users LIMIT 1".into(),
                    description: "count users".into(),
                    reasoning: "single aggregate".into(),
                    sample_rows: vec![serde_json::json!({"n": 4})],
                    column_schema: vec![ColumnMeta {
                        name: "n".into(),
                        inferred_type: "INTEGER".into(),
                    }],
                    record_count_observed: 1,
                    execution_ms: 2,
                },
                "2026-01-01T00:00:00Z".into(),
            )
            .unwrap();
        library
    }

    fn core_with(script: Vec<ScriptedTurn>, ledger: Arc<TokenLedger>) -> AgentCore {
        AgentCore::new(
            Box::new(MockChat::new(script)),
            Profile::Coding,
            ledger,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn fenced_script_is_extracted_and_billed_as_coding() {
        let ledger = Arc::new(TokenLedger::new());
        let core = core_with(
            vec![ScriptedTurn::Reply(text_reply(
                "```python\nresult = db.query(\"SELECT count(*) AS n FROM users\")\n```",
            ))],
            Arc::clone(&ledger),
        );
        let script = synthesize(
            &core,
            &AgentPrompts::embedded(),
            "how many users?",
            "count all users",
            &library_with_one_step(),
            None,
        )
        .await
        .unwrap();
        assert!(script.code.starts_with("result ="));
        assert!(!script.code.contains("```"));
        assert_eq!(ledger.profile_totals(Profile::Coding).calls, 1);
    }

    #[tokio::test]
    async fn empty_script_is_an_error() {
        let core = core_with(
            vec![ScriptedTurn::Reply(text_reply("```python\n\n```"))],
            Arc::new(TokenLedger::new()),
        );
        let err = synthesize(
            &core,
            &AgentPrompts::embedded(),
            "q",
            "d",
            &library_with_one_step(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::StructuredOutput(_)));
    }
}
