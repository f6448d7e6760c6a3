//! The ReAct loop: reason, act through the tool surface, observe, repeat.
//!
//! One tool call per turn; previews keep the transcript bounded; errors the
//! model can remediate are fed back as structured observations instead of
//! aborting. The loop ends on `synthesize_final_script`, turn exhaustion,
//! wall-clock exhaustion, or cancellation.

use serde_json::Value;
use tracing::{debug, info, warn};

use process_event::{StepStatus, StepStatusUpdate};

use crate::agent::core::AgentCore;
use crate::agent::planner::Plan;
use crate::agent::prompts::AgentPrompts;
use crate::error::AgentError;
use crate::ledger::{ToolCallRecord, ToolCallStatus};
use crate::llm::{ChatRequest, ToolCall};
use crate::message::Message;
use crate::tools::{ToolCallContext, ToolError, ToolRegistry, SYNTHESIZE_FINAL_SCRIPT};

/// UI index of the first execution step (after the synthetic `thinking` and
/// `generating_steps` entries).
pub const EXECUTION_STEPS_BASE: usize = 2;

/// How the loop ended when it ended well.
#[derive(Clone, Debug)]
pub struct ReactOutcome {
    pub turns_used: usize,
    /// Tool calls dispatched (UI execution steps consumed).
    pub steps_dispatched: usize,
    /// Description passed to `synthesize_final_script`.
    pub final_description: String,
}

pub struct ReactLoop<'a> {
    pub core: &'a AgentCore,
    pub prompts: &'a AgentPrompts,
    pub registry: &'a ToolRegistry,
    pub ctx: &'a ToolCallContext,
    pub max_turns: usize,
    pub wall_budget: std::time::Duration,
}

impl<'a> ReactLoop<'a> {
    pub async fn run(&self, user_query: &str, plan: &Plan) -> Result<ReactOutcome, AgentError> {
        let deadline = tokio::time::Instant::now() + self.wall_budget;
        let mut transcript = vec![
            Message::system(self.prompts.react.clone()),
            Message::user(format!(
                "Question: {user_query}\n\nAdvisory plan:\n{}",
                plan.render()
            )),
        ];
        let specs = self.registry.specs();
        let mut dispatched_steps = 0usize;

        for turn in 1..=self.max_turns {
            if self.ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::BudgetExhausted(format!(
                    "wall clock budget ({:?}) exhausted after {} turns",
                    self.wall_budget,
                    turn - 1
                )));
            }

            let response = self
                .core
                .call(ChatRequest::with_tools(
                    transcript.clone(),
                    specs.clone(),
                    true,
                ))
                .await?;
            let usage = response.usage.clone();

            let Some(call) = response.tool_calls.first().cloned() else {
                debug!(turn, "model replied without a tool call, nudging");
                transcript.push(Message::assistant(response.content));
                transcript.push(Message::user(
                    "You must call exactly one tool each turn. When the stored steps \
                     answer the question, call synthesize_final_script."
                        .to_string(),
                ));
                continue;
            };

            let mut assistant_note = response.content.clone();
            if !assistant_note.is_empty() {
                assistant_note.push('\n');
            }
            assistant_note.push_str(&format!("[calling {}]", call.name));
            transcript.push(Message::assistant(assistant_note));

            if call.name == SYNTHESIZE_FINAL_SCRIPT {
                match self.dispatch(&call, usage.as_ref(), dispatched_steps).await? {
                    DispatchResult::Ok(_) => {
                        let final_description = self
                            .ctx
                            .final_request
                            .lock()
                            .unwrap()
                            .clone()
                            .unwrap_or_default();
                        info!(turns = turn, "exploration frozen, synthesizing");
                        return Ok(ReactOutcome {
                            turns_used: turn,
                            steps_dispatched: dispatched_steps,
                            final_description,
                        });
                    }
                    DispatchResult::Recovered(observation) => {
                        transcript.push(Message::user(observation));
                        continue;
                    }
                }
            }

            let observation = match self.dispatch(&call, usage.as_ref(), dispatched_steps).await? {
                DispatchResult::Ok(view) => {
                    dispatched_steps += 1;
                    format!("Tool {} result:\n{view}", call.name)
                }
                DispatchResult::Recovered(observation) => {
                    dispatched_steps += 1;
                    observation
                }
            };
            transcript.push(Message::user(observation));

            if response.tool_calls.len() > 1 {
                warn!(extra = response.tool_calls.len() - 1, "parallel tool calls rejected");
                transcript.push(Message::user(format!(
                    "Parallel tool calls are not supported; only `{}` was executed. \
                     Issue the remaining calls one turn at a time.",
                    call.name
                )));
            }
        }

        Err(AgentError::BudgetExhausted(format!(
            "turn budget ({}) exhausted without synthesize_final_script",
            self.max_turns
        )))
    }

    /// Executes one tool call, emitting step status and billing the ledger.
    /// Remediable failures come back as `Recovered` observations; only
    /// cancellation aborts the loop.
    async fn dispatch(
        &self,
        call: &ToolCall,
        usage: Option<&crate::llm::LlmUsage>,
        dispatched_steps: usize,
    ) -> Result<DispatchResult, AgentError> {
        let step_index = EXECUTION_STEPS_BASE + dispatched_steps;
        self.ctx.set_step_index(step_index);

        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(v) => v,
            Err(e) => {
                let err = ToolError::InvalidArguments(format!("arguments are not JSON: {e}"));
                self.emit_transition(step_index, &call.name, StepStatus::Error, None, usage, Some(&err))
                    .await;
                self.ctx.ledger_record(ToolCallRecord {
                    name: call.name.clone(),
                    arguments: Value::String(call.arguments.clone()),
                    started_at: chrono::Utc::now().to_rfc3339(),
                    ended_at: chrono::Utc::now().to_rfc3339(),
                    status: ToolCallStatus::Error,
                    error_kind: Some(err.error_kind()),
                    input_tokens: usage.map(|u| u.prompt_tokens as u64).unwrap_or(0),
                    output_tokens: usage.map(|u| u.completion_tokens as u64).unwrap_or(0),
                });
                return Ok(DispatchResult::Recovered(format!(
                    "Tool {} error:\n{}",
                    call.name,
                    err.to_model_view()
                )));
            }
        };

        self.emit_transition(step_index, &call.name, StepStatus::Running, None, None, None)
            .await;
        let started = tokio::time::Instant::now();
        let started_ts = chrono::Utc::now().to_rfc3339();

        match self.registry.call(&call.name, args.clone(), self.ctx).await {
            Ok(view) => {
                let duration = started.elapsed().as_millis() as u64;
                self.emit_transition(
                    step_index,
                    &call.name,
                    StepStatus::Completed,
                    Some(duration),
                    usage,
                    None,
                )
                .await;
                self.ctx.ledger_record(ToolCallRecord {
                    name: call.name.clone(),
                    arguments: args,
                    started_at: started_ts,
                    ended_at: chrono::Utc::now().to_rfc3339(),
                    status: ToolCallStatus::Ok,
                    error_kind: None,
                    input_tokens: usage.map(|u| u.prompt_tokens as u64).unwrap_or(0),
                    output_tokens: usage.map(|u| u.completion_tokens as u64).unwrap_or(0),
                });
                Ok(DispatchResult::Ok(view.to_string()))
            }
            Err(ToolError::Cancelled) => Err(AgentError::Cancelled),
            Err(ToolError::Sandbox(crate::sandbox::SandboxFailure::Cancelled)) => {
                Err(AgentError::Cancelled)
            }
            Err(err) => {
                let duration = started.elapsed().as_millis() as u64;
                self.emit_transition(
                    step_index,
                    &call.name,
                    StepStatus::Error,
                    Some(duration),
                    usage,
                    Some(&err),
                )
                .await;
                self.ctx.ledger_record(ToolCallRecord {
                    name: call.name.clone(),
                    arguments: args,
                    started_at: started_ts,
                    ended_at: chrono::Utc::now().to_rfc3339(),
                    status: match err {
                        ToolError::Sandbox(crate::sandbox::SandboxFailure::Timeout(_)) => {
                            ToolCallStatus::Timeout
                        }
                        _ => ToolCallStatus::Error,
                    },
                    error_kind: Some(err.error_kind()),
                    input_tokens: usage.map(|u| u.prompt_tokens as u64).unwrap_or(0),
                    output_tokens: usage.map(|u| u.completion_tokens as u64).unwrap_or(0),
                });
                Ok(DispatchResult::Recovered(format!(
                    "Tool {} error:\n{}",
                    call.name,
                    err.to_model_view()
                )))
            }
        }
    }

    /// Status transitions are structural: send with back-pressure instead
    /// of the lossy path used for progress.
    async fn emit_transition(
        &self,
        step_index: usize,
        operation: &str,
        status: StepStatus,
        duration_ms: Option<u64>,
        usage: Option<&crate::llm::LlmUsage>,
        error: Option<&ToolError>,
    ) {
        let update = StepStatusUpdate {
            step_index,
            status: Some(status),
            operation_status: Some(operation.to_string()),
            duration_ms,
            input_tokens: usage.map(|u| u.prompt_tokens as u64),
            output_tokens: usage.map(|u| u.completion_tokens as u64),
            error_message: error.map(|e| e.to_string()),
            ..Default::default()
        };
        let _ = self
            .ctx
            .events
            .send(process_event::ProcessEvent::StepStatusUpdate(update))
            .await;
    }
}

enum DispatchResult {
    Ok(String),
    Recovered(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::core::AgentCore;
    use crate::ledger::TokenLedger;
    use crate::llm::{tool_call_reply, LlmResponse, MockChat, Profile, ScriptedTurn, ToolCall};
    use crate::tools::test_support::context_with_db;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn core_with(mock: MockChat, ledger: Arc<TokenLedger>) -> AgentCore {
        AgentCore::new(
            Box::new(mock),
            Profile::Reasoning,
            ledger,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
    }

    fn sql_probe() -> ScriptedTurn {
        ScriptedTurn::Reply(tool_call_reply(
            "execute_test_query",
            json!({
                "code": "SELECT id, status FROM users WHERE status = 'ACTIVE'",
                "kind": "SQL"
            }),
        ))
    }

    fn store_step() -> ScriptedTurn {
        // Stored code must match the stashed execution's normalized SQL.
        ScriptedTurn::Reply(tool_call_reply(
            "store_validated_step",
            json!({
                "description": "active users probe",
                "code": "SELECT id, status FROM users WHERE status = 'ACTIVE' LIMIT 1000",
                "reasoning": "validate the filter before counting everything"
            }),
        ))
    }

    fn finalize() -> ScriptedTurn {
        ScriptedTurn::Reply(tool_call_reply(
            "synthesize_final_script",
            json!({"description": "list all active users"}),
        ))
    }

    async fn run_loop(
        script: Vec<ScriptedTurn>,
        max_turns: usize,
    ) -> (
        Result<ReactOutcome, AgentError>,
        crate::tools::ToolCallContext,
        Arc<TokenLedger>,
        tempfile::TempDir,
    ) {
        let (mut ctx, dir, _rx) = context_with_db();
        let ledger = Arc::new(TokenLedger::new());
        ctx.ledger = Arc::clone(&ledger);
        let core = core_with(MockChat::new(script), Arc::clone(&ledger));
        let registry = ToolRegistry::standard();
        let result = ReactLoop {
            core: &core,
            prompts: &AgentPrompts::embedded(),
            registry: &registry,
            ctx: &ctx,
            max_turns,
            wall_budget: Duration::from_secs(30),
        }
        .run("Find active users", &Plan::default())
        .await;
        (result, ctx, ledger, dir)
    }

    #[tokio::test]
    async fn probe_store_finalize_happy_path() {
        let (result, ctx, ledger, _dir) =
            run_loop(vec![sql_probe(), store_step(), finalize()], 10).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.turns_used, 3);
        assert_eq!(outcome.final_description, "list all active users");
        assert_eq!(ctx.library.len(), 1);
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.tool_calls.len(), 3);
        assert!(snapshot.total_input_tokens > 0);
    }

    #[tokio::test]
    async fn invalid_arguments_are_recovered_within_the_loop() {
        let bad_call = ScriptedTurn::Reply(tool_call_reply(
            "filter_endpoints",
            json!({"ids": "not-an-array"}),
        ));
        let (result, ctx, ledger, _dir) =
            run_loop(vec![bad_call, sql_probe(), store_step(), finalize()], 10).await;
        assert_eq!(result.unwrap().turns_used, 4);
        assert_eq!(ctx.library.len(), 1);
        let kinds: Vec<_> = ledger
            .snapshot()
            .tool_calls
            .iter()
            .map(|t| t.status)
            .collect();
        assert_eq!(kinds[0], ToolCallStatus::Error);
    }

    #[tokio::test]
    async fn parallel_tool_calls_keep_first_and_append_validation() {
        let mut reply = tool_call_reply("load_sql_schema", json!({}));
        reply.tool_calls.push(ToolCall {
            id: Some("extra".into()),
            name: "load_read_endpoints".into(),
            arguments: "{}".into(),
        });
        let mock = MockChat::new(vec![
            ScriptedTurn::Reply(reply),
            sql_probe(),
            store_step(),
            finalize(),
        ]);

        let (mut ctx, _dir, _rx) = context_with_db();
        let ledger = Arc::new(TokenLedger::new());
        ctx.ledger = Arc::clone(&ledger);
        let core = core_with(mock, Arc::clone(&ledger));
        let registry = ToolRegistry::standard();
        let react = ReactLoop {
            core: &core,
            prompts: &AgentPrompts::embedded(),
            registry: &registry,
            ctx: &ctx,
            max_turns: 10,
            wall_budget: Duration::from_secs(30),
        };
        react.run("q", &Plan::default()).await.unwrap();

        // The second turn's request transcript carries the validation note.
        let core_requests = ledger.snapshot();
        assert_eq!(core_requests.tool_calls[0].name, "load_sql_schema");
        assert_eq!(core_requests.tool_calls.len(), 4);
    }

    #[tokio::test]
    async fn turn_budget_exhaustion_is_typed() {
        let script = (0..5)
            .map(|_| ScriptedTurn::Reply(tool_call_reply("load_sql_schema", json!({}))))
            .collect();
        let (result, _ctx, _ledger, _dir) = run_loop(script, 3).await;
        let err = result.unwrap_err();
        assert!(matches!(err, AgentError::BudgetExhausted(_)));
        assert!(err.to_string().contains("turn budget"));
    }

    #[tokio::test]
    async fn prose_only_reply_gets_a_nudge_and_loop_continues() {
        let prose = ScriptedTurn::Reply(LlmResponse {
            content: "The answer is probably 42.".into(),
            tool_calls: vec![],
            usage: None,
        });
        let (result, _ctx, _ledger, _dir) =
            run_loop(vec![prose, sql_probe(), store_step(), finalize()], 10).await;
        assert_eq!(result.unwrap().turns_used, 4);
    }

    #[tokio::test]
    async fn cancellation_checkpoint_fires_between_turns() {
        let (ctx, _dir, _rx) = context_with_db();
        ctx.cancel.cancel();
        let core = core_with(MockChat::new(vec![sql_probe()]), Arc::new(TokenLedger::new()));
        let registry = ToolRegistry::standard();
        let err = ReactLoop {
            core: &core,
            prompts: &AgentPrompts::embedded(),
            registry: &registry,
            ctx: &ctx,
            max_turns: 10,
            wall_budget: Duration::from_secs(30),
        }
        .run("q", &Plan::default())
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn finalize_without_stored_steps_is_fed_back() {
        let (result, ctx, _ledger, _dir) = run_loop(
            vec![finalize(), sql_probe(), store_step(), finalize()],
            10,
        )
        .await;
        assert_eq!(result.unwrap().turns_used, 4);
        assert_eq!(ctx.library.len(), 1);
    }
}
