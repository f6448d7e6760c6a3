//! Conversation messages passed to chat models.

use serde::{Deserialize, Serialize};

/// One message in an agent transcript: role + plain-text content.
///
/// Tool observations are folded into the transcript as user messages by the
/// ReAct loop, so every provider sees the same three roles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "content", rename_all = "snake_case")]
pub enum Message {
    System(String),
    User(String),
    Assistant(String),
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System(content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User(content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant(content.into())
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System(c) | Message::User(c) | Message::Assistant(c) => c,
        }
    }

    /// Approximate transcript weight in bytes; used by the context budgeter.
    pub fn byte_len(&self) -> usize {
        self.content().len()
    }
}
