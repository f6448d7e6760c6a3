//! Process supervisor: owns one query end-to-end.
//!
//! `start` allocates the per-process world (bus, ledger, library, sandbox,
//! governor, tool context), launches the background drive task and returns
//! the process id immediately. `stream` opens a consumer on the bus,
//! `cancel` is idempotent and bounded by the grace period, `status` returns
//! a snapshot. Every failure inside the drive converts to one terminal
//! `plan_error`; a cancelled process terminates as `cancelled`, never
//! `failed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use process_event::{
    Phase, PlanStatusPayload, PlannedStepInfo, ProcessEvent, StepStatus, StepStatusUpdate,
};

use crate::agent::{
    self, AgentCore, AgentPrompts, Plan, ReactLoop, RelationGraph, EXECUTION_STEPS_BASE,
};
use crate::bus::{BusConfig, EventBus, EventStream};
use crate::catalog::ApiCatalog;
use crate::config::Settings;
use crate::error::{AgentError, ErrorKind};
use crate::govern::RateGovernor;
use crate::history::HistoryStore;
use crate::ledger::{LedgerSnapshot, TokenLedger};
use crate::library::CodeLibrary;
use crate::llm::{build_chat_model, ChatModel, Profile};
use crate::sandbox::{ExecutionRequest, SandboxExecutor, SandboxProgress};
use crate::schema::{SchemaView, SqlExecutor};
use crate::tools::{ToolCallContext, ToolRegistry};

/// Lifecycle status of one process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Planning => "planning",
            ProcessStatus::Executing => "executing",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Cancelled => "cancelled",
        }
    }
}

/// Options for one `start` call.
#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    /// History owner; `None` skips history recording.
    pub user_id: Option<String>,
    /// Return the synthesized script instead of executing it.
    pub emit_only: bool,
}

/// Point-in-time view returned by `status`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ProcessSnapshot {
    pub process_id: String,
    pub user_query: String,
    pub status: ProcessStatus,
    pub started_at: String,
    pub cancel_requested: bool,
    pub stored_steps: usize,
    pub ledger: LedgerSnapshot,
}

struct ProcessHandle {
    user_query: String,
    started_at: String,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    cancel_requested: AtomicBool,
    status: Mutex<ProcessStatus>,
    library: Arc<CodeLibrary>,
    ledger: Arc<TokenLedger>,
}

impl ProcessHandle {
    fn status(&self) -> ProcessStatus {
        *self.status.lock().unwrap()
    }

    /// Status transitions stop at the first terminal state.
    fn set_status(&self, next: ProcessStatus) {
        let mut status = self.status.lock().unwrap();
        if !status.is_terminal() {
            *status = next;
        }
    }
}

/// Builds chat models per profile; swapped for scripted mocks in tests.
pub type ChatFactory =
    Arc<dyn Fn(Profile) -> Result<Box<dyn ChatModel>, AgentError> + Send + Sync>;

pub struct ProcessSupervisor {
    settings: Arc<Settings>,
    prompts: Arc<AgentPrompts>,
    history: Option<HistoryStore>,
    bus_config: BusConfig,
    chat_factory: ChatFactory,
    processes: DashMap<String, Arc<ProcessHandle>>,
}

impl ProcessSupervisor {
    pub fn new(settings: Settings) -> Result<Self, AgentError> {
        let history = match &settings.history_db_path {
            Some(path) => Some(
                HistoryStore::new(path)
                    .map_err(|e| AgentError::Internal(format!("history store: {e}")))?,
            ),
            None => None,
        };
        let prompts = AgentPrompts::load(None)
            .map_err(|e| AgentError::Internal(format!("prompt load: {e}")))?;
        let settings = Arc::new(settings);
        let factory_settings = Arc::clone(&settings);
        Ok(Self {
            settings,
            prompts: Arc::new(prompts),
            history,
            bus_config: BusConfig::default(),
            chat_factory: Arc::new(move |profile| build_chat_model(profile, &factory_settings)),
            processes: DashMap::new(),
        })
    }

    /// Replaces the provider factory (tests drive the whole pipeline with
    /// scripted models).
    pub fn with_chat_factory(mut self, factory: ChatFactory) -> Self {
        self.chat_factory = factory;
        self
    }

    pub fn with_bus_config(mut self, config: BusConfig) -> Self {
        self.bus_config = config;
        self
    }

    /// Launches a process; returns its id immediately.
    pub async fn start(&self, user_query: &str, options: ProcessOptions) -> String {
        let process_id = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now().to_rfc3339();
        let handle = Arc::new(ProcessHandle {
            user_query: user_query.to_string(),
            started_at: started_at.clone(),
            bus: Arc::new(EventBus::new(process_id.clone(), self.bus_config)),
            cancel: CancellationToken::new(),
            cancel_requested: AtomicBool::new(false),
            status: Mutex::new(ProcessStatus::Planning),
            library: Arc::new(CodeLibrary::new(
                self.settings.preview_cap,
                self.settings.max_stored_bytes_per_step,
            )),
            ledger: Arc::new(TokenLedger::new()),
        });
        self.processes.insert(process_id.clone(), Arc::clone(&handle));

        let history_id = match (&self.history, &options.user_id) {
            (Some(history), Some(user_id)) => history
                .record_start(user_id, user_query, &started_at)
                .await
                .map_err(|e| warn!(error = %e, "history record_start failed"))
                .ok(),
            _ => None,
        };

        let drive = DriveTask {
            settings: Arc::clone(&self.settings),
            prompts: Arc::clone(&self.prompts),
            chat_factory: Arc::clone(&self.chat_factory),
            history: self.history.clone(),
            history_id,
            options,
            handle: Arc::clone(&handle),
        };
        tokio::spawn(drive.run());
        process_id
    }

    /// Opens an ordered event stream; `None` for an unknown process.
    pub fn stream(&self, process_id: &str) -> Option<EventStream> {
        self.processes.get(process_id).map(|h| h.bus.subscribe())
    }

    /// Requests cancellation; idempotent. Returns false for an unknown id.
    pub fn cancel(&self, process_id: &str) -> bool {
        let Some(handle) = self.processes.get(process_id).map(|h| Arc::clone(&h)) else {
            return false;
        };
        if handle.cancel_requested.swap(true, Ordering::SeqCst) {
            return true; // already requested; single plan_cancelled stands
        }
        info!(process_id, "cancellation requested");
        handle.cancel.cancel();

        // The drive publishes plan_cancelled at its next checkpoint; this
        // watchdog forcibly terminates a process that misses the grace
        // window (e.g. a wedged sandbox child).
        let grace = self.settings.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !handle.status().is_terminal() {
                warn!("cancel grace expired, forcing terminal state");
                handle.set_status(ProcessStatus::Cancelled);
                let _ = handle.bus.publish(ProcessEvent::PlanCancelled).await;
            }
        });
        true
    }

    pub fn status(&self, process_id: &str) -> Option<ProcessSnapshot> {
        self.processes.get(process_id).map(|handle| ProcessSnapshot {
            process_id: process_id.to_string(),
            user_query: handle.user_query.clone(),
            status: handle.status(),
            started_at: handle.started_at.clone(),
            cancel_requested: handle.cancel_requested.load(Ordering::SeqCst),
            stored_steps: handle.library.len(),
            ledger: handle.ledger.snapshot(),
        })
    }

    /// Drops the per-process state of a terminal process.
    pub fn release(&self, process_id: &str) -> bool {
        match self.processes.get(process_id) {
            Some(handle) if handle.status().is_terminal() => {
                drop(handle);
                self.processes.remove(process_id).is_some()
            }
            _ => false,
        }
    }
}

struct DriveTask {
    settings: Arc<Settings>,
    prompts: Arc<AgentPrompts>,
    chat_factory: ChatFactory,
    history: Option<HistoryStore>,
    history_id: Option<i64>,
    options: ProcessOptions,
    handle: Arc<ProcessHandle>,
}

impl DriveTask {
    async fn run(self) {
        let handle = Arc::clone(&self.handle);
        let timeout = self.settings.process_timeout;
        let history = self.history.clone();
        let history_id = self.history_id;

        let outcome = tokio::time::timeout(
            timeout,
            std::panic::AssertUnwindSafe(self.drive()).catch_unwind(),
        )
        .await;

        let final_status = match outcome {
            Ok(Ok(Ok(()))) => {
                handle.set_status(ProcessStatus::Completed);
                handle.status()
            }
            Ok(Ok(Err(AgentError::Cancelled))) => {
                handle.set_status(ProcessStatus::Cancelled);
                let _ = handle.bus.publish(ProcessEvent::PlanCancelled).await;
                ProcessStatus::Cancelled
            }
            Ok(Ok(Err(err))) => {
                error!(error = %err, "process failed");
                handle.set_status(ProcessStatus::Failed);
                let _ = handle
                    .bus
                    .publish(ProcessEvent::PlanError {
                        error_kind: err.kind().as_str().to_string(),
                        message: err.redacted_message(),
                    })
                    .await;
                ProcessStatus::Failed
            }
            Ok(Err(panic)) => {
                error!(?panic, "process drive panicked");
                handle.set_status(ProcessStatus::Failed);
                let _ = handle
                    .bus
                    .publish(ProcessEvent::PlanError {
                        error_kind: ErrorKind::InternalError.as_str().to_string(),
                        message: "an unexpected internal error occurred".to_string(),
                    })
                    .await;
                ProcessStatus::Failed
            }
            Err(_elapsed) => {
                // A cancel may have raced the overall deadline; cancelled
                // processes never terminate as failed.
                if handle.cancel_requested.load(Ordering::SeqCst) {
                    handle.set_status(ProcessStatus::Cancelled);
                    let _ = handle.bus.publish(ProcessEvent::PlanCancelled).await;
                    ProcessStatus::Cancelled
                } else {
                    handle.set_status(ProcessStatus::Failed);
                    let _ = handle
                        .bus
                        .publish(ProcessEvent::PlanError {
                            error_kind: ErrorKind::BudgetExhausted.as_str().to_string(),
                            message: format!("process exceeded {timeout:?}"),
                        })
                        .await;
                    ProcessStatus::Failed
                }
            }
        };

        if let (Some(history), Some(id)) = (history, history_id) {
            if let Err(e) = history.record_outcome(id, final_status.as_str()).await {
                warn!(error = %e, "history record_outcome failed");
            }
        }
    }

    /// The happy-path pipeline; every `?` funnels into one terminal event
    /// in `run`.
    async fn drive(self) -> Result<(), AgentError> {
        let settings = &self.settings;
        let handle = &self.handle;
        let bus = Arc::clone(&handle.bus);

        // Event pump: tools and the loop send on a channel; the pump owns
        // bus publishing (and its back-pressure) so tool code stays sync.
        let (events_tx, mut events_rx) = mpsc::channel::<ProcessEvent>(1024);
        let pump_bus = Arc::clone(&bus);
        let pump = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if pump_bus.publish(event).await.is_err() {
                    break;
                }
            }
        });

        let governor = Arc::new(RateGovernor::new(
            settings.api_concurrent_limit,
            settings.api_rate_per_second,
        ));
        let sandbox = Arc::new(SandboxExecutor::new(
            settings.sandbox_interpreter.clone(),
            settings.max_output_bytes,
            Arc::clone(&governor),
        ));
        let ctx = ToolCallContext {
            settings: Arc::clone(settings),
            catalog: ApiCatalog::new(),
            schema: SchemaView::new(),
            library: Arc::clone(&handle.library),
            ledger: Arc::clone(&handle.ledger),
            sql: Arc::new(SqlExecutor::new(
                &settings.okta_db_path,
                settings.sql_row_cap,
                settings.step_execution_timeout,
            )),
            sandbox: Arc::clone(&sandbox),
            events: events_tx.clone(),
            cancel: handle.cancel.clone(),
            current_step_index: std::sync::atomic::AtomicUsize::new(0),
            last_execution: Mutex::new(None),
            final_request: Mutex::new(None),
        };

        let reasoning = AgentCore::new(
            (self.chat_factory)(Profile::Reasoning)?,
            Profile::Reasoning,
            Arc::clone(&handle.ledger),
            handle.cancel.clone(),
            settings.llm_call_timeout,
        );
        let coding = AgentCore::new(
            (self.chat_factory)(Profile::Coding)?,
            Profile::Coding,
            Arc::clone(&handle.ledger),
            handle.cancel.clone(),
            settings.llm_call_timeout,
        );

        let result = self
            .pipeline(&ctx, &reasoning, &coding, &sandbox, &events_tx)
            .await;

        // Close the pump before the terminal event is published by `run`
        // so ordering stays: pipeline events, then terminal.
        drop(ctx);
        drop(events_tx);
        let _ = pump.await;
        result
    }

    async fn pipeline(
        &self,
        ctx: &ToolCallContext,
        reasoning: &AgentCore,
        coding: &AgentCore,
        sandbox: &SandboxExecutor,
        events: &mpsc::Sender<ProcessEvent>,
    ) -> Result<(), AgentError> {
        let settings = &self.settings;
        let handle = &self.handle;
        let send = |event: ProcessEvent| async move {
            let _ = events.send(event).await;
        };

        // Planning.
        send(ProcessEvent::PhaseUpdate {
            phase: Phase::Planning,
            warning: None,
        })
        .await;
        if handle.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let plan = agent::plan(
            reasoning,
            &self.prompts,
            &handle.user_query,
            &ctx.catalog.read_summary(),
            &ctx.schema.summary(),
            &[],
        )
        .await?;

        send(ProcessEvent::PlanStatus(PlanStatusPayload {
            plan_details: Some(json!({ "steps_summary": plan.steps_summary() })),
            status: Some("generated".to_string()),
        }))
        .await;
        send(ProcessEvent::StepPlanInfo {
            steps: step_plan_info(&plan),
        })
        .await;

        // Execution.
        handle.set_status(ProcessStatus::Executing);
        send(ProcessEvent::PhaseUpdate {
            phase: Phase::Executing,
            warning: None,
        })
        .await;
        send(ProcessEvent::PlanStatus(PlanStatusPayload {
            plan_details: None,
            status: Some("starting_execution".to_string()),
        }))
        .await;

        let registry = ToolRegistry::standard();
        let outcome = ReactLoop {
            core: reasoning,
            prompts: &self.prompts,
            registry: &registry,
            ctx,
            max_turns: settings.max_turns,
            wall_budget: settings.process_timeout,
        }
        .run(&handle.user_query, &plan)
        .await?;

        // Finalizing: relation analysis (advisory) then synthesis.
        send(ProcessEvent::PhaseUpdate {
            phase: Phase::Finalizing,
            warning: None,
        })
        .await;
        let relation_index = EXECUTION_STEPS_BASE + outcome.steps_dispatched;
        let final_index = relation_index + 1;

        let relation: Option<RelationGraph> = if handle.library.len() >= 2 {
            send(step_running(relation_index, "RELATIONSHIP_ANALYSIS")).await;
            match agent::analyze(reasoning, &self.prompts, &handle.library).await {
                Ok(graph) => {
                    send(step_completed(relation_index, "RELATIONSHIP_ANALYSIS")).await;
                    Some(graph)
                }
                Err(err) => {
                    warn!(error = %err, "relation analysis failed, continuing without it");
                    send(ProcessEvent::PhaseUpdate {
                        phase: Phase::Finalizing,
                        warning: Some(
                            "relationship analysis unavailable; joining heuristically".to_string(),
                        ),
                    })
                    .await;
                    send(step_errored(relation_index, "RELATIONSHIP_ANALYSIS", &err)).await;
                    None
                }
            }
        } else {
            None
        };

        if handle.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        send(step_running(final_index, "finalizing_results")).await;
        let script = agent::synthesize(
            coding,
            &self.prompts,
            &handle.user_query,
            &outcome.final_description,
            &handle.library,
            relation.as_ref(),
        )
        .await?;

        let formatted = if self.options.emit_only {
            process_event::FormattedResponse {
                content: json!({
                    "script": script.code,
                    "description": script.description,
                }),
                display_type: process_event::DisplayType::Json,
                metadata: process_event::ResultMetadata {
                    headers: None,
                    total: None,
                    data_sources: handle.library.data_sources(),
                },
            }
        } else {
            let request = ExecutionRequest {
                code: script.code.clone(),
                variables: final_variables(&handle.library),
                limit: None,
                okta_org_url: settings.okta_org_url.clone(),
                okta_api_token: settings.okta_api_token.clone(),
                db_path: settings.okta_db_path.display().to_string(),
            };
            let (progress_tx, mut progress_rx) = mpsc::channel::<SandboxProgress>(16);
            let progress_events = events.clone();
            let progress_pump = tokio::spawn(async move {
                while let Some(progress) = progress_rx.recv().await {
                    let _ = progress_events
                        .send(ProcessEvent::StepStatusUpdate(StepStatusUpdate {
                            step_index: final_index,
                            status: Some(StepStatus::Running),
                            subprocess_progress_percent: Some(progress.percent),
                            subprocess_progress_details: Some(progress.message),
                            ..Default::default()
                        }))
                        .await;
                }
            });
            let executed = sandbox
                .execute(
                    &request,
                    settings.final_execution_timeout,
                    Some(progress_tx),
                    &handle.cancel,
                )
                .await;
            progress_pump.abort();
            let outcome = executed.map_err(|failure| match failure {
                crate::sandbox::SandboxFailure::Cancelled => AgentError::Cancelled,
                other => AgentError::Internal(format!("final script failed: {other}")),
            })?;
            agent::format_result(
                reasoning,
                &self.prompts,
                &handle.user_query,
                outcome.result,
                handle.library.data_sources(),
            )
            .await
        };

        send(step_completed(final_index, "finalizing_results")).await;
        // Status flips before the terminal event so a consumer that drains
        // the stream never reads a non-terminal snapshot afterwards.
        handle.set_status(ProcessStatus::Completed);
        let _ = events
            .send(ProcessEvent::FinalResult {
                formatted_response: formatted,
                status: "completed".to_string(),
            })
            .await;
        Ok(())
    }
}

/// Flattened step list for the UI: synthetic bookends around the plan.
fn step_plan_info(plan: &Plan) -> Vec<PlannedStepInfo> {
    let mut steps = vec![
        PlannedStepInfo {
            step_index: 0,
            name: "thinking".to_string(),
            entity: None,
            operation: None,
        },
        PlannedStepInfo {
            step_index: 1,
            name: "generating_steps".to_string(),
            entity: None,
            operation: None,
        },
    ];
    for (i, step) in plan.steps.iter().enumerate() {
        steps.push(PlannedStepInfo {
            step_index: EXECUTION_STEPS_BASE + i,
            name: format!("step_{}", i + 1),
            entity: Some(step.entity.clone()),
            operation: Some(step.operation.clone()),
        });
    }
    let next = EXECUTION_STEPS_BASE + plan.steps.len();
    steps.push(PlannedStepInfo {
        step_index: next,
        name: "RELATIONSHIP_ANALYSIS".to_string(),
        entity: None,
        operation: None,
    });
    steps.push(PlannedStepInfo {
        step_index: next + 1,
        name: "finalizing_results".to_string(),
        entity: None,
        operation: None,
    });
    steps
}

/// The final script sees every stored step's sample under `step_N`.
fn final_variables(library: &CodeLibrary) -> serde_json::Map<String, serde_json::Value> {
    let mut variables = serde_json::Map::new();
    for step in library.list() {
        variables.insert(
            format!("step_{}", step.step_id),
            serde_json::Value::Array(step.sample_rows.clone()),
        );
    }
    variables
}

fn step_running(step_index: usize, operation: &str) -> ProcessEvent {
    ProcessEvent::StepStatusUpdate(StepStatusUpdate {
        step_index,
        status: Some(StepStatus::Running),
        operation_status: Some(operation.to_string()),
        ..Default::default()
    })
}

fn step_completed(step_index: usize, operation: &str) -> ProcessEvent {
    ProcessEvent::StepStatusUpdate(StepStatusUpdate {
        step_index,
        status: Some(StepStatus::Completed),
        operation_status: Some(operation.to_string()),
        ..Default::default()
    })
}

fn step_errored(step_index: usize, operation: &str, err: &AgentError) -> ProcessEvent {
    ProcessEvent::StepStatusUpdate(StepStatusUpdate {
        step_index,
        status: Some(StepStatus::Error),
        operation_status: Some(operation.to_string()),
        error_message: Some(err.to_string()),
        ..Default::default()
    })
}
