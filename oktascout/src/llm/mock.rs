//! Scripted chat model for offline tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::llm::{ChatModel, ChatRequest, LlmResponse, LlmUsage, ToolCall};

/// One scripted turn: a canned reply or an injected failure.
#[derive(Clone)]
pub enum ScriptedTurn {
    Reply(LlmResponse),
    RateLimited { wait_seconds: Option<u64> },
    Fail(String),
}

/// Chat model that replays a fixed script and records every request it saw.
/// When the script runs dry it returns an empty assistant message, which the
/// ReAct loop treats as a malformed turn.
pub struct MockChat {
    script: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockChat {
    pub fn new(script: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a script of plain-text replies.
    pub fn replies(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|t| ScriptedTurn::Reply(text_reply(t)))
                .collect(),
        )
    }

    /// Requests observed so far, oldest first.
    pub fn seen_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// A plain text reply with nominal usage.
pub fn text_reply(content: &str) -> LlmResponse {
    LlmResponse {
        content: content.to_string(),
        tool_calls: vec![],
        usage: Some(LlmUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
    }
}

/// A reply that calls one tool with the given JSON arguments.
pub fn tool_call_reply(name: &str, arguments: serde_json::Value) -> LlmResponse {
    LlmResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: Some(format!("call-{name}")),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }],
        usage: Some(LlmUsage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        }),
    }
}

#[async_trait]
impl ChatModel for MockChat {
    async fn invoke(&self, request: &ChatRequest) -> Result<LlmResponse, AgentError> {
        self.requests.lock().unwrap().push(request.clone());
        let turn = self.script.lock().unwrap().pop_front();
        match turn {
            Some(ScriptedTurn::Reply(r)) => Ok(r),
            Some(ScriptedTurn::RateLimited { wait_seconds }) => {
                Err(AgentError::LlmRateLimited { wait_seconds })
            }
            Some(ScriptedTurn::Fail(message)) => Err(AgentError::Llm(message)),
            None => Ok(LlmResponse::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn script_replays_in_order_and_records_requests() {
        let mock = MockChat::new(vec![
            ScriptedTurn::Reply(text_reply("first")),
            ScriptedTurn::Fail("boom".into()),
        ]);
        let req = ChatRequest::text(vec![Message::user("q")]);
        assert_eq!(mock.invoke(&req).await.unwrap().content, "first");
        assert!(mock.invoke(&req).await.is_err());
        assert_eq!(mock.seen_requests().len(), 2);
    }
}
