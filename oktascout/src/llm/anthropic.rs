//! Anthropic Messages API driver (direct HTTP; no SDK).
//!
//! System messages are lifted into the request's `system` field; tool calls
//! arrive as `tool_use` content blocks and are mapped onto [`ToolCall`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::Settings;
use crate::error::AgentError;
use crate::llm::{
    http_client_with_headers, ChatModel, ChatRequest, LlmResponse, LlmUsage, ToolCall,
    ToolChoiceMode,
};
use crate::message::Message;

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct ChatAnthropic {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Serialize)]
struct Payload {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<HashMap<&'static str, &'static str>>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    usage: WireUsage,
}

impl ChatAnthropic {
    pub fn from_settings(model: String, settings: &Settings) -> Result<Self, AgentError> {
        Ok(Self {
            http: http_client_with_headers(settings)?,
            api_base: settings
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: settings.api_key.clone(),
            model,
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    fn build_payload(&self, request: &ChatRequest) -> Payload {
        let (system, rest): (Vec<&Message>, Vec<&Message>) = request
            .messages
            .iter()
            .partition(|m| matches!(m, Message::System(_)));
        let system = if system.is_empty() {
            None
        } else {
            Some(
                system
                    .iter()
                    .map(|m| m.content())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            )
        };

        let messages = rest
            .into_iter()
            .map(|m| WireMessage {
                role: match m {
                    Message::Assistant(_) => "assistant",
                    _ => "user",
                },
                content: m.content().to_string(),
            })
            .collect();

        let tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        let tool_choice = if tools.is_empty() {
            None
        } else {
            let mode = match request.tool_choice {
                ToolChoiceMode::Auto => "auto",
                ToolChoiceMode::None => "none",
                ToolChoiceMode::Required => "any",
            };
            Some(HashMap::from([("type", mode)]))
        };

        Payload {
            model: self.model.clone(),
            system,
            messages,
            max_tokens: self.max_tokens,
            tools,
            tool_choice,
        }
    }

    fn map_status_error(status: reqwest::StatusCode, retry_after: Option<u64>) -> AgentError {
        match status.as_u16() {
            429 => AgentError::LlmRateLimited {
                wait_seconds: retry_after,
            },
            401 => AgentError::Llm("anthropic: invalid API key".into()),
            403 => AgentError::Llm("anthropic: permission denied".into()),
            404 => AgentError::Llm("anthropic: not found".into()),
            529 => AgentError::Llm("anthropic: overloaded".into()),
            other => AgentError::Llm(format!("anthropic: unexpected status {other}")),
        }
    }
}

#[async_trait]
impl ChatModel for ChatAnthropic {
    async fn invoke(&self, request: &ChatRequest) -> Result<LlmResponse, AgentError> {
        let payload = self.build_payload(request);
        let url = format!("{}/v1/messages", self.api_base.trim_end_matches('/'));
        debug!(model = %self.model, message_count = payload.messages.len(), "anthropic messages create");

        let res = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json; charset=utf-8")
            .json(&payload)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("anthropic transport: {e}")))?;

        if !res.status().is_success() {
            let retry_after = res
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(Self::map_status_error(res.status(), retry_after));
        }

        let body: ApiResponse = res
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("anthropic body parse: {e}")))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in body.content {
            match block.kind.as_str() {
                "text" => content.push_str(block.text.as_deref().unwrap_or_default()),
                "tool_use" => {
                    let arguments = block
                        .input
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(ToolCall {
                        id: block.id,
                        name: block.name.unwrap_or_default(),
                        arguments,
                    });
                }
                other => trace!(kind = %other, "ignoring content block"),
            }
        }

        Ok(LlmResponse {
            content,
            tool_calls,
            usage: Some(LlmUsage {
                prompt_tokens: body.usage.input_tokens,
                completion_tokens: body.usage.output_tokens,
                total_tokens: body.usage.input_tokens + body.usage.output_tokens,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolSpec;

    fn client() -> ChatAnthropic {
        let mut s = Settings::default();
        s.api_key = "test-key".into();
        ChatAnthropic::from_settings("claude-sonnet-4-20250514".into(), &s).unwrap()
    }

    #[test]
    fn system_messages_are_lifted_out_of_the_transcript() {
        let req = ChatRequest::text(vec![
            Message::system("You answer questions about an Okta tenant."),
            Message::user("how many groups?"),
            Message::assistant("Checking."),
        ]);
        let payload = client().build_payload(&req);
        assert!(payload.system.as_deref().unwrap().contains("Okta tenant"));
        assert_eq!(payload.messages.len(), 2);
        assert_eq!(payload.messages[0].role, "user");
        assert_eq!(payload.messages[1].role, "assistant");
    }

    #[test]
    fn required_tool_choice_maps_to_any() {
        let req = ChatRequest::with_tools(
            vec![Message::user("q")],
            vec![ToolSpec {
                name: "list_stored_steps".into(),
                description: None,
                input_schema: serde_json::json!({"type": "object"}),
            }],
            true,
        );
        let payload = client().build_payload(&req);
        assert_eq!(payload.tool_choice.unwrap().get("type"), Some(&"any"));
    }

    #[test]
    fn rate_limit_status_carries_wait_hint() {
        let err = ChatAnthropic::map_status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(13));
        assert!(matches!(
            err,
            AgentError::LlmRateLimited {
                wait_seconds: Some(13)
            }
        ));
    }
}
