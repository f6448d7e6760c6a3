//! Shared agent capability set: call the gateway under timeout and
//! cancellation, parse structured output with bounded reparse retries,
//! account tokens.
//!
//! Every agent (planner, react, relation, coding, formatter) is this core
//! plus a prompt and an output shape.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::AgentError;
use crate::ledger::TokenLedger;
use crate::llm::{ChatModel, ChatRequest, LlmResponse, Profile};
use crate::message::Message;

/// Reparse attempts when the model returns malformed structured output.
const STRUCTURED_RETRIES: u32 = 2;

pub struct AgentCore {
    model: Box<dyn ChatModel>,
    profile: Profile,
    ledger: Arc<TokenLedger>,
    cancel: CancellationToken,
    call_timeout: Duration,
}

impl AgentCore {
    pub fn new(
        model: Box<dyn ChatModel>,
        profile: Profile,
        ledger: Arc<TokenLedger>,
        cancel: CancellationToken,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            profile,
            ledger,
            cancel,
            call_timeout,
        }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// One gateway call: races the provider against cancellation and the
    /// per-call timeout, then bills usage to the ledger.
    pub async fn call(&self, request: ChatRequest) -> Result<LlmResponse, AgentError> {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = tokio::time::timeout(self.call_timeout, self.model.invoke(&request)) => {
                match outcome {
                    Err(_) => {
                        return Err(AgentError::Llm(format!(
                            "chat call exceeded {:?}",
                            self.call_timeout
                        )))
                    }
                    Ok(result) => result?,
                }
            }
        };
        if let Some(usage) = &response.usage {
            self.ledger.record_usage(self.profile, usage);
        }
        Ok(response)
    }

    /// Plain-text call, then parse the content as `T`. Malformed output is
    /// fed back to the model with the parse error up to
    /// [`STRUCTURED_RETRIES`] times before giving up.
    pub async fn call_structured<T: DeserializeOwned>(
        &self,
        mut messages: Vec<Message>,
    ) -> Result<T, AgentError> {
        let mut last_error = String::new();
        for attempt in 0..=STRUCTURED_RETRIES {
            let response = self.call(ChatRequest::text(messages.clone())).await?;
            match parse_json_block::<T>(&response.content) {
                Ok(value) => return Ok(value),
                Err(parse_error) => {
                    warn!(attempt, error = %parse_error, "structured output parse failed");
                    last_error = parse_error.clone();
                    messages.push(Message::assistant(response.content));
                    messages.push(Message::user(format!(
                        "Your last reply could not be parsed: {parse_error}. \
                         Reply again with only the requested JSON."
                    )));
                }
            }
        }
        Err(AgentError::StructuredOutput(last_error))
    }
}

/// Extracts and parses the first JSON value in a model reply, tolerating
/// code fences and surrounding prose.
pub fn parse_json_block<T: DeserializeOwned>(content: &str) -> Result<T, String> {
    let trimmed = strip_code_fence(content);
    let candidate = match (trimmed.find(['{', '[']), trimmed) {
        (Some(start), text) => &text[start..],
        (None, _) => return Err("no JSON object or array found".to_string()),
    };
    // Parse from the first opening bracket; trailing prose is cut by
    // decoding just one value.
    let mut deserializer = serde_json::Deserializer::from_str(candidate);
    T::deserialize(&mut deserializer).map_err(|e| e.to_string())
}

/// Returns the content of the first fenced block, or the input unchanged.
pub fn strip_code_fence(content: &str) -> &str {
    let Some(open) = content.find("```") else {
        return content;
    };
    let after_open = &content[open + 3..];
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}
