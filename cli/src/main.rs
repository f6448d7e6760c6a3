//! oktascout CLI binary: submit one query, stream its events, cancel on
//! Ctrl-C.
//!
//! Transport surfaces (SSE, sessions) live elsewhere; this binary talks to
//! the supervisor directly and renders each enveloped event as one line
//! (or raw JSON with `--json`).

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use oktascout::{ProcessOptions, ProcessStatus, ProcessSupervisor, Settings};
use process_event::ProcessEvent;

#[derive(Parser, Debug)]
#[command(
    name = "oktascout",
    about = "Ask a natural-language question about your Okta tenant"
)]
struct Args {
    /// The question to answer.
    query: String,

    /// Return the synthesized script instead of executing it.
    #[arg(long)]
    emit_only: bool,

    /// History owner id; history is skipped when unset.
    #[arg(long, env = "OKTASCOUT_USER")]
    user: Option<String>,

    /// Print raw event JSON instead of the condensed progress view.
    #[arg(long)]
    json: bool,
}

fn init_tracing(settings: &Settings) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "oktascout.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(settings.log_level_console.clone()));
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new(settings.log_level_file.clone()));

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    guard
}

fn render(event: &ProcessEvent) -> Option<String> {
    match event {
        ProcessEvent::PhaseUpdate { phase, warning } => {
            let mut line = format!("phase: {phase:?}");
            if let Some(w) = warning {
                line.push_str(&format!(" (warning: {w})"));
            }
            Some(line)
        }
        ProcessEvent::PlanStatus(p) => p.status.as_ref().map(|s| format!("plan: {s}")),
        ProcessEvent::StepPlanInfo { steps } => Some(format!("steps planned: {}", steps.len())),
        ProcessEvent::StepStatusUpdate(u) => {
            let status = u
                .status
                .map(|s| format!("{s:?}").to_lowercase())
                .unwrap_or_else(|| "update".into());
            let mut line = format!(
                "step {} {} {}",
                u.step_index,
                status,
                u.operation_status.as_deref().unwrap_or("")
            );
            if let Some(p) = u.subprocess_progress_percent {
                line.push_str(&format!(" [{p}%]"));
            }
            if let Some(info) = &u.rate_limit_info {
                line.push_str(&format!(" (rate limited, retry in {}s)", info.wait_seconds));
            }
            if let Some(err) = &u.error_message {
                line.push_str(&format!(" error: {err}"));
            }
            Some(line)
        }
        ProcessEvent::FinalResult {
            formatted_response, ..
        } => Some(format!(
            "result ({:?}):\n{}",
            formatted_response.display_type,
            serde_json::to_string_pretty(&formatted_response.content).unwrap_or_default()
        )),
        ProcessEvent::PlanError { error_kind, message } => {
            Some(format!("error [{error_kind}]: {message}"))
        }
        ProcessEvent::PlanCancelled => Some("cancelled".to_string()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = init_tracing(&settings);

    let supervisor = match ProcessSupervisor::new(settings) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("startup error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let process_id = supervisor
        .start(
            &args.query,
            ProcessOptions {
                user_id: args.user.clone(),
                emit_only: args.emit_only,
            },
        )
        .await;
    let Some(mut stream) = supervisor.stream(&process_id) else {
        eprintln!("process vanished before streaming");
        return ExitCode::FAILURE;
    };
    tracing::info!(%process_id, "process started");

    let mut cancel_requested = false;
    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                if args.json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => tracing::warn!(error = %e, "event encode failed"),
                    }
                } else if let Some(line) = render(&event.event) {
                    println!("{line}");
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                eprintln!("cancelling…");
                supervisor.cancel(&process_id);
                cancel_requested = true;
            }
        }
    }

    match supervisor.status(&process_id).map(|s| s.status) {
        Some(ProcessStatus::Completed) => ExitCode::SUCCESS,
        Some(ProcessStatus::Cancelled) => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use process_event::{RateLimitInfo, StepStatus, StepStatusUpdate};

    #[test]
    fn render_covers_step_updates_with_rate_limit() {
        let line = render(&ProcessEvent::StepStatusUpdate(StepStatusUpdate {
            step_index: 3,
            status: Some(StepStatus::Running),
            operation_status: Some("execute_test_query".into()),
            subprocess_progress_percent: Some(40),
            rate_limit_info: Some(RateLimitInfo { wait_seconds: 13 }),
            ..Default::default()
        }))
        .unwrap();
        assert!(line.contains("step 3 running execute_test_query"));
        assert!(line.contains("[40%]"));
        assert!(line.contains("13s"));
    }

    #[test]
    fn render_skips_bare_plan_payloads() {
        assert!(render(&ProcessEvent::PlanStatus(Default::default())).is_none());
        assert!(render(&ProcessEvent::PlanCancelled).is_some());
    }
}
