//! Model provider abstraction.
//!
//! The agent talks to the provider through [`LlmClient`], which returns a
//! stream of [`StreamEvent`]s terminated by a finalized [`FinalMessage`].
//! Wire types mirror the Anthropic Messages API.

mod anthropic;
mod scripted;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use anthropic::{AnthropicClient, MessageAccumulator};
pub use scripted::{ScriptedClient, ScriptedRound};

/// Errors raised while obtaining a response from the provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Provider error ({kind}): {message}")]
    Provider { kind: String, message: String },

    #[error("Malformed stream: {0}")]
    MalformedStream(String),
}

/// Role of a message in the provider conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A typed content block inside a conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// Message content: plain text or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One entry of the history sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ConversationMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// A tool declaration exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Request body for a streamed completion.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub tools: Vec<ToolDescriptor>,
    pub messages: Vec<ConversationMessage>,
    pub stream: bool,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    PauseTurn,
    Refusal,
    #[serde(other)]
    Other,
}

/// The finalized response of one round.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FinalMessage {
    pub stop_reason: Option<StopReason>,
    pub content: Vec<ContentBlock>,
}

impl FinalMessage {
    /// Tool invocations in the order the model declared them.
    pub fn tool_uses(&self) -> Vec<ContentBlock> {
        self.content
            .iter()
            .filter(|block| matches!(block, ContentBlock::ToolUse { .. }))
            .cloned()
            .collect()
    }
}

/// Incremental events of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text fragment.
    TextDelta(String),
    /// A content block opened.
    BlockStart { index: usize },
    /// A content block closed.
    BlockStop { index: usize },
    /// The stream finished; carries the reconstructed message.
    Completed(FinalMessage),
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// A streaming model provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Open a streamed completion for `request`, authenticated with `credential`.
    async fn stream_message(
        &self,
        credential: &str,
        request: &MessageRequest,
    ) -> Result<MessageStream, LlmError>;
}
