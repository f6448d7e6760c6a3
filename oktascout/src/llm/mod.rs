//! Chat model gateway: one interface over heterogeneous providers.
//!
//! Agents talk to [`ChatModel`] only; the concrete driver is picked by
//! [`build_chat_model`] from [`Settings`] and wrapped in a bounded retry
//! layer. Two model profiles exist per process: `reasoning` (planner, ReAct,
//! relation analysis, formatter) and `coding` (final script synthesis).
//!
//! Token usage is returned on every response and recorded by the caller into
//! the process [`TokenLedger`](crate::ledger::TokenLedger).

mod anthropic;
mod mock;
mod openai;
mod retry;

pub use anthropic::ChatAnthropic;
pub use mock::{text_reply, tool_call_reply, MockChat, ScriptedTurn};
pub use openai::ChatOpenAi;
pub use retry::{RetryConfig, RetryingChat};

use async_trait::async_trait;

use crate::config::{AiProvider, Settings};
use crate::error::AgentError;
use crate::message::Message;
use crate::tools::ToolSpec;

/// Model profile: which configured model id a call is billed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Profile {
    Reasoning,
    Coding,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Reasoning => "reasoning",
            Profile::Coding => "coding",
        }
    }

    pub fn model<'a>(&self, settings: &'a Settings) -> &'a str {
        match self {
            Profile::Reasoning => &settings.reasoning_model,
            Profile::Coding => &settings.coding_model,
        }
    }
}

/// Tool choice mode when tools are present: model may choose (auto), must
/// not use (none), or must use (required).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ToolChoiceMode {
    #[default]
    Auto,
    None,
    Required,
}

/// Token usage for one chat call (prompt + completion).
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    /// Raw JSON argument string as produced by the model.
    pub arguments: String,
}

/// Response from one chat call: assistant text and any tool calls.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<LlmUsage>,
}

/// One chat call: transcript plus the tool surface offered for this turn.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoiceMode,
}

impl ChatRequest {
    /// Plain text call: no tools offered.
    pub fn text(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoiceMode::Auto,
        }
    }

    /// Tool-calling call; `required` forces the model to pick a tool.
    pub fn with_tools(messages: Vec<Message>, tools: Vec<ToolSpec>, required: bool) -> Self {
        Self {
            messages,
            tools,
            tool_choice: if required {
                ToolChoiceMode::Required
            } else {
                ToolChoiceMode::Auto
            },
        }
    }
}

/// Chat model: given a transcript and tool surface, return assistant text,
/// tool calls and usage. Implementations: [`ChatOpenAi`] (openai,
/// openai_compatible, azure_openai, vertex_ai), [`ChatAnthropic`], and
/// [`MockChat`] for tests.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(&self, request: &ChatRequest) -> Result<LlmResponse, AgentError>;
}

/// Builds the provider driver for a profile and wraps it in the retry layer.
pub fn build_chat_model(
    profile: Profile,
    settings: &Settings,
) -> Result<Box<dyn ChatModel>, AgentError> {
    let model = profile.model(settings).to_string();
    let inner: Box<dyn ChatModel> = match settings.provider {
        AiProvider::Anthropic => Box::new(ChatAnthropic::from_settings(model, settings)?),
        _ => Box::new(ChatOpenAi::from_settings(model, settings)?),
    };
    Ok(Box::new(RetryingChat::new(
        inner,
        RetryConfig::default().with_max_attempts(settings.llm_max_retries.max(1)),
    )))
}

/// Builds the reqwest client shared by providers, applying the opaque
/// custom header map from settings. Unparsable header names are skipped with
/// a warning rather than failing the whole process.
pub(crate) fn http_client_with_headers(
    settings: &Settings,
) -> Result<reqwest::Client, AgentError> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &settings.custom_http_headers {
        let parsed_name = reqwest::header::HeaderName::from_bytes(name.as_bytes());
        let parsed_value = reqwest::header::HeaderValue::from_str(value);
        match (parsed_name, parsed_value) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => {
                tracing::warn!(header = %name, "skipping invalid custom HTTP header");
            }
        }
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| AgentError::Internal(format!("http client build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_picks_configured_model() {
        let mut settings = Settings::default();
        settings.reasoning_model = "r-model".into();
        settings.coding_model = "c-model".into();
        assert_eq!(Profile::Reasoning.model(&settings), "r-model");
        assert_eq!(Profile::Coding.model(&settings), "c-model");
    }

    #[test]
    fn build_chat_model_selects_provider() {
        let mut settings = Settings::default();
        settings.api_key = "k".into();
        assert!(build_chat_model(Profile::Reasoning, &settings).is_ok());
        settings.provider = AiProvider::Anthropic;
        assert!(build_chat_model(Profile::Coding, &settings).is_ok());
    }

    #[test]
    fn invalid_custom_header_is_skipped_not_fatal() {
        let mut settings = Settings::default();
        settings
            .custom_http_headers
            .insert("bad header name".into(), "v".into());
        settings.custom_http_headers.insert("x-ok".into(), "1".into());
        assert!(http_client_with_headers(&settings).is_ok());
    }
}
