//! Agents of one process: a shared capability core plus one module per
//! role.
//!
//! - [`core::AgentCore`]: call the gateway under timeout/cancellation,
//!   parse structured output with bounded retries, account tokens.
//! - [`planner`]: one-shot advisory plan (fails open).
//! - [`react`]: the bounded explore loop over the tool surface.
//! - [`relation`]: join-key analysis across stored steps (advisory).
//! - [`coding`]: final script synthesis on the coding profile.
//! - [`formatter`]: display payload with sampling above the context budget.

pub mod coding;
pub mod core;
pub mod formatter;
pub mod planner;
pub mod prompts;
pub mod react;
pub mod relation;

pub use coding::{synthesize, FinalScript};
pub use core::AgentCore;
pub use formatter::format_result;
pub use planner::{plan, Plan, PlanStep};
pub use prompts::{AgentPrompts, PromptLoadError};
pub use react::{ReactLoop, ReactOutcome, EXECUTION_STEPS_BASE};
pub use relation::{analyze, candidate_joins, JoinProposal, RelationGraph};
