//! oktascout: ReAct execution core for an Okta tenant assistant.
//!
//! One user question becomes one **process**: the supervisor plans, drives a
//! bounded ReAct loop over a closed tool surface (API catalog probes, safe
//! SQL, sandboxed code execution), stores validated artifacts in a code
//! library, synthesizes a final script, and streams typed progress events to
//! the client until a terminal event.
//!
//! # Main entry points
//!
//! - [`ProcessSupervisor`]: `start` / `stream` / `cancel` / `status` for one
//!   query lifecycle.
//! - [`Settings`]: env-driven configuration (provider, model profiles, caps,
//!   timeouts).
//! - [`ChatModel`]: uniform chat interface over the configured provider;
//!   [`MockChat`] scripts turns for offline tests.
//!
//! The streaming wire shape lives in the `process-event` crate.

pub mod agent;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod error;
pub mod govern;
pub mod history;
pub mod ledger;
pub mod library;
pub mod llm;
pub mod message;
pub mod process;
pub mod sandbox;
pub mod schema;
pub mod sqlguard;
pub mod tools;

pub use bus::{BusConfig, EventBus, EventStream};
pub use catalog::{ApiCatalog, EndpointKind, EndpointSummary};
pub use config::{AiProvider, Settings, SettingsError};
pub use error::{AgentError, ErrorKind};
pub use govern::RateGovernor;
pub use history::{HistoryEntry, HistoryStore};
pub use ledger::{LedgerSnapshot, TokenLedger};
pub use library::{CodeLibrary, StepKind, StoredStep};
pub use llm::{
    build_chat_model, text_reply, tool_call_reply, ChatModel, ChatRequest, LlmResponse, LlmUsage,
    MockChat, Profile, ScriptedTurn,
};
pub use message::Message;
pub use process::{
    ChatFactory, ProcessOptions, ProcessSnapshot, ProcessStatus, ProcessSupervisor,
};
pub use schema::{SchemaView, SqlExecutor};
pub use sqlguard::{validate_sql, SqlGuardError, ValidatedSql};
pub use tools::{Tool, ToolCallContext, ToolRegistry, ToolSpec};
