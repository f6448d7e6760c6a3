//! OpenAI Chat Completions driver (openai, openai_compatible, azure_openai,
//! vertex_ai via an OpenAI-compatible endpoint).
//!
//! Non-streaming: the event stream clients see is built from process events,
//! not model tokens, so one completed response per call is all the loop
//! needs.

use async_trait::async_trait;
use tracing::{debug, trace};

use async_openai::{
    config::{AzureConfig, OpenAIConfig},
    types::chat::{
        ChatCompletionMessageToolCalls, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage, ChatCompletionTool,
        ChatCompletionToolChoiceOption, ChatCompletionTools, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, FunctionObject,
        ToolChoiceOptions,
    },
    Client,
};

use crate::config::{AiProvider, Settings};
use crate::error::AgentError;
use crate::llm::{
    http_client_with_headers, ChatModel, ChatRequest, LlmResponse, LlmUsage, ToolCall,
    ToolChoiceMode,
};
use crate::message::Message;

/// Azure uses a distinct config type in `async-openai`; both flavors share
/// request construction and response mapping.
enum Flavor {
    Standard(Client<OpenAIConfig>),
    Azure(Client<AzureConfig>),
}

pub struct ChatOpenAi {
    flavor: Flavor,
    model: String,
}

impl ChatOpenAi {
    pub fn from_settings(model: String, settings: &Settings) -> Result<Self, AgentError> {
        let http = http_client_with_headers(settings)?;
        let flavor = match settings.provider {
            AiProvider::AzureOpenAi => {
                let endpoint = settings.api_base.clone().ok_or_else(|| {
                    AgentError::Internal("azure_openai requires AI_API_BASE".into())
                })?;
                let config = AzureConfig::new()
                    .with_api_base(endpoint)
                    .with_api_version(settings.azure_api_version.clone())
                    .with_deployment_id(model.clone())
                    .with_api_key(settings.api_key.clone());
                Flavor::Azure(Client::with_config(config).with_http_client(http))
            }
            _ => {
                let mut config = OpenAIConfig::new().with_api_key(settings.api_key.clone());
                if let Some(base) = &settings.api_base {
                    config = config.with_api_base(base.clone());
                }
                Flavor::Standard(Client::with_config(config).with_http_client(http))
            }
        };
        Ok(Self { flavor, model })
    }

    fn messages_to_request(messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::System(s) => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(s.as_str()),
                ),
                Message::User(s) => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(s.as_str()),
                ),
                Message::Assistant(s) => {
                    ChatCompletionRequestMessage::Assistant((s.as_str()).into())
                }
            })
            .collect()
    }

    fn build_request(
        &self,
        request: &ChatRequest,
    ) -> Result<CreateChatCompletionRequest, AgentError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone());
        args.messages(Self::messages_to_request(&request.messages));

        if !request.tools.is_empty() {
            let chat_tools: Vec<ChatCompletionTools> = request
                .tools
                .iter()
                .map(|t| {
                    ChatCompletionTools::Function(ChatCompletionTool {
                        function: FunctionObject {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: Some(t.input_schema.clone()),
                            ..Default::default()
                        },
                    })
                })
                .collect();
            args.tools(chat_tools);
            let mode = match request.tool_choice {
                ToolChoiceMode::Auto => ToolChoiceOptions::Auto,
                ToolChoiceMode::None => ToolChoiceOptions::None,
                ToolChoiceMode::Required => ToolChoiceOptions::Required,
            };
            args.tool_choice(ChatCompletionToolChoiceOption::Mode(mode));
        }

        args.build()
            .map_err(|e| AgentError::Internal(format!("request build failed: {e}")))
    }

    fn map_response(response: CreateChatCompletionResponse) -> Result<LlmResponse, AgentError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Llm("provider returned no choices".into()))?;

        let msg = choice.message;
        let content = msg.content.unwrap_or_default();
        let tool_calls: Vec<ToolCall> = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| {
                if let ChatCompletionMessageToolCalls::Function(f) = tc {
                    Some(ToolCall {
                        name: f.function.name,
                        arguments: f.function.arguments,
                        id: Some(f.id),
                    })
                } else {
                    None
                }
            })
            .collect();

        let usage = response.usage.map(|u| LlmUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        Ok(LlmResponse {
            content,
            tool_calls,
            usage,
        })
    }

    fn map_error(e: async_openai::error::OpenAIError) -> AgentError {
        let text = e.to_string();
        let lowered = text.to_lowercase();
        if lowered.contains("429") || lowered.contains("rate limit") {
            AgentError::LlmRateLimited { wait_seconds: None }
        } else {
            AgentError::Llm(text)
        }
    }
}

#[async_trait]
impl ChatModel for ChatOpenAi {
    async fn invoke(&self, request: &ChatRequest) -> Result<LlmResponse, AgentError> {
        let body = self.build_request(request)?;
        debug!(
            model = %self.model,
            message_count = request.messages.len(),
            tools_count = request.tools.len(),
            "openai chat create"
        );
        trace!(request = ?body, "openai request body");

        let response = match &self.flavor {
            Flavor::Standard(client) => client.chat().create(body).await,
            Flavor::Azure(client) => client.chat().create(body).await,
        }
        .map_err(Self::map_error)?;

        trace!(response = ?response, "openai response body");
        Self::map_response(response)
    }
}
