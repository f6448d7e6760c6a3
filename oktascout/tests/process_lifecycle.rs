//! End-to-end process lifecycle over scripted chat models: event ordering,
//! terminal semantics, cancellation, failure conversion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use oktascout::{
    tool_call_reply, text_reply, AgentError, ChatFactory, ChatModel, ChatRequest, LlmResponse,
    MockChat, ProcessOptions, ProcessStatus, Profile, ScriptedTurn, Settings,
};
use process_event::ProcessEvent;

fn seeded_snapshot(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let db_path = dir.path().join("snap.db");
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE users (id TEXT PRIMARY KEY, login TEXT, status TEXT, created_at TEXT);
        INSERT INTO users VALUES
            ('u1', 'ada@example.com', 'ACTIVE', '2026-07-20T00:00:00Z'),
            ('u2', 'sam@example.com', 'ACTIVE', '2026-07-25T00:00:00Z'),
            ('u3', 'kim@example.com', 'LOCKED_OUT', '2026-05-01T00:00:00Z');
        "#,
    )
    .unwrap();
    db_path
}

fn settings_with(db_path: std::path::PathBuf, history: Option<std::path::PathBuf>) -> Settings {
    let mut settings = Settings::default();
    settings.okta_db_path = db_path;
    settings.history_db_path = history;
    settings.process_timeout = Duration::from_secs(20);
    settings.cancel_grace = Duration::from_secs(2);
    settings
}

/// Factory that replays one script per profile, per process.
fn scripted_factory(
    reasoning: Vec<ScriptedTurn>,
    coding: Vec<ScriptedTurn>,
) -> ChatFactory {
    let reasoning = Arc::new(Mutex::new(reasoning));
    let coding = Arc::new(Mutex::new(coding));
    Arc::new(move |profile: Profile| {
        let script = match profile {
            Profile::Reasoning => reasoning.lock().unwrap().clone(),
            Profile::Coding => coding.lock().unwrap().clone(),
        };
        Ok(Box::new(MockChat::new(script)) as Box<dyn ChatModel>)
    })
}

const PLAN_JSON: &str = r#"{
    "strategy": "Count via the snapshot.",
    "steps": [{
        "index": 1,
        "tool_kind": "SQL",
        "entity": "user",
        "operation": "count recent active users",
        "query_context": "users table",
        "critical": true
    }]
}"#;

fn sql_exploration_script() -> Vec<ScriptedTurn> {
    vec![
        ScriptedTurn::Reply(text_reply(PLAN_JSON)),
        ScriptedTurn::Reply(tool_call_reply(
            "execute_test_query",
            json!({
                "code": "SELECT count(*) AS n FROM users WHERE status = 'ACTIVE' LIMIT 1",
                "kind": "SQL"
            }),
        )),
        ScriptedTurn::Reply(tool_call_reply(
            "store_validated_step",
            json!({
                "description": "count active users",
                "code": "SELECT count(*) AS n FROM users WHERE status = 'ACTIVE' LIMIT 1",
                "reasoning": "single aggregate answers the question"
            }),
        )),
        ScriptedTurn::Reply(tool_call_reply(
            "synthesize_final_script",
            json!({"description": "emit the active-user count"}),
        )),
    ]
}

#[tokio::test]
async fn sql_path_runs_to_final_result_with_ordered_events() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = oktascout::ProcessSupervisor::new(settings_with(seeded_snapshot(&dir), None))
        .unwrap()
        .with_chat_factory(scripted_factory(
            sql_exploration_script(),
            vec![ScriptedTurn::Reply(text_reply(
                "```python\nresult = db.query(\"SELECT count(*) AS n FROM users WHERE status = 'ACTIVE'\")\n```",
            ))],
        ));

    let process_id = supervisor
        .start(
            "How many active users were created in the last 30 days?",
            ProcessOptions {
                emit_only: true,
                ..Default::default()
            },
        )
        .await;
    let mut stream = supervisor.stream(&process_id).unwrap();

    let mut seen = Vec::new();
    let mut expected_seq = 0;
    while let Some(event) = stream.next().await {
        assert_eq!(event.envelope.seq, expected_seq, "gap-free sequence");
        assert_eq!(event.envelope.process_id, process_id);
        expected_seq += 1;
        seen.push(event.event);
    }

    // Structural shape: planning phase, plan, step list, execution, final.
    assert!(matches!(seen[0], ProcessEvent::PhaseUpdate { .. }));
    assert!(seen.iter().any(|e| matches!(e, ProcessEvent::PlanStatus(p)
        if p.plan_details.is_some())));
    assert!(seen.iter().any(
        |e| matches!(e, ProcessEvent::StepPlanInfo { steps } if steps.iter().any(|s| s.name == "RELATIONSHIP_ANALYSIS"))
    ));
    let last = seen.last().unwrap();
    let ProcessEvent::FinalResult {
        formatted_response, ..
    } = last
    else {
        panic!("stream must end in final_result, got {last:?}");
    };
    assert!(formatted_response.content["script"]
        .as_str()
        .unwrap()
        .contains("db.query"));
    assert_eq!(formatted_response.metadata.data_sources, vec!["database"]);

    let snapshot = supervisor.status(&process_id).unwrap();
    assert_eq!(snapshot.status, ProcessStatus::Completed);
    assert_eq!(snapshot.stored_steps, 1);
    assert!(snapshot.ledger.total_input_tokens > 0);
    assert!(supervisor.release(&process_id));
}

/// Chat model that hangs until cancelled; used to park a process mid-turn.
struct HangingChat;

#[async_trait]
impl ChatModel for HangingChat {
    async fn invoke(&self, _request: &ChatRequest) -> Result<LlmResponse, AgentError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(LlmResponse::default())
    }
}

#[tokio::test]
async fn cancel_reaches_terminal_cancelled_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let factory: ChatFactory =
        Arc::new(|_profile| Ok(Box::new(HangingChat) as Box<dyn ChatModel>));
    let supervisor = oktascout::ProcessSupervisor::new(settings_with(seeded_snapshot(&dir), None))
        .unwrap()
        .with_chat_factory(factory);

    let process_id = supervisor.start("long query", ProcessOptions::default()).await;
    let mut stream = supervisor.stream(&process_id).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(supervisor.cancel(&process_id));
    assert!(supervisor.cancel(&process_id), "second cancel still acks");

    let mut cancelled_events = 0;
    let mut saw_final_result = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let next = tokio::time::timeout_at(deadline, stream.next()).await;
        match next {
            Ok(Some(event)) => {
                if matches!(event.event, ProcessEvent::PlanCancelled) {
                    cancelled_events += 1;
                }
                if matches!(event.event, ProcessEvent::FinalResult { .. }) {
                    saw_final_result = true;
                }
            }
            Ok(None) => break,
            Err(_) => panic!("stream did not terminate within cancel_grace"),
        }
    }
    assert_eq!(cancelled_events, 1, "exactly one plan_cancelled");
    assert!(!saw_final_result);
    assert_eq!(
        supervisor.status(&process_id).unwrap().status,
        ProcessStatus::Cancelled
    );
}

#[tokio::test]
async fn provider_failure_terminates_with_plan_error() {
    let dir = tempfile::tempdir().unwrap();
    let factory: ChatFactory = Arc::new(|_profile| {
        Ok(Box::new(MockChat::new(vec![
            ScriptedTurn::Fail("503 upstream".into()),
            ScriptedTurn::Fail("503 upstream".into()),
            ScriptedTurn::Fail("503 upstream".into()),
        ])) as Box<dyn ChatModel>)
    });
    let supervisor = oktascout::ProcessSupervisor::new(settings_with(seeded_snapshot(&dir), None))
        .unwrap()
        .with_chat_factory(factory);

    let process_id = supervisor.start("q", ProcessOptions::default()).await;
    let mut stream = supervisor.stream(&process_id).unwrap();
    let mut last = None;
    while let Some(event) = stream.next().await {
        last = Some(event.event);
    }
    let Some(ProcessEvent::PlanError { error_kind, .. }) = last else {
        panic!("expected plan_error terminal");
    };
    assert_eq!(error_kind, "llm_error");
    assert_eq!(
        supervisor.status(&process_id).unwrap().status,
        ProcessStatus::Failed
    );
}

#[tokio::test]
async fn history_records_query_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let history_path = dir.path().join("history.db");
    let supervisor = oktascout::ProcessSupervisor::new(settings_with(
        seeded_snapshot(&dir),
        Some(history_path.clone()),
    ))
    .unwrap()
    .with_chat_factory(scripted_factory(
        sql_exploration_script(),
        vec![ScriptedTurn::Reply(text_reply(
            "```python\nresult = {'n': 2}\n```",
        ))],
    ));

    let process_id = supervisor
        .start(
            "How many active users?",
            ProcessOptions {
                user_id: Some("alice".into()),
                emit_only: true,
            },
        )
        .await;
    let mut stream = supervisor.stream(&process_id).unwrap();
    while stream.next().await.is_some() {}

    let history = oktascout::HistoryStore::new(&history_path).unwrap();
    let entries = history.list("alice").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].query, "How many active users?");
    assert_eq!(entries[0].status, "completed");
}
