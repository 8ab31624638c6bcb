//! Chat transcript: UI-facing messages and the reducer that builds them
//! from agent events.

mod reducer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::ToolCallResult;
use crate::llm::{ConversationMessage, MessageContent, Role};

pub use reducer::{drive_turn, Effect, TurnReducer, TurnSink};

/// A classified slice of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentSegment {
    /// Text produced before or between tool calls.
    Thinking { text: String },
    /// A finished tool call.
    Tool {
        #[serde(rename = "toolResult")]
        tool_result: ToolCallResult,
    },
    /// Text produced after the last tool call.
    Answer { text: String },
}

impl ContentSegment {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentSegment::Thinking { text } | ContentSegment::Answer { text } => {
                Some(text.as_str())
            }
            ContentSegment::Tool { .. } => None,
        }
    }
}

/// One message of the session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    /// Cumulative text; only ever appended to.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<ContentSegment>>,
    #[serde(default)]
    pub is_streaming: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            content: text.into(),
            tool_calls: None,
            segments: None,
            is_streaming: false,
            created_at: Utc::now(),
        }
    }

    /// Empty assistant message that a turn streams into.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: String::new(),
            tool_calls: Some(Vec::new()),
            segments: None,
            is_streaming: true,
            created_at: Utc::now(),
        }
    }
}

fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Rebuild provider history from the transcript.
///
/// `content` is authoritative; messages with blank content carry nothing the
/// model could use and are skipped.
pub fn conversation_history(messages: &[ChatMessage]) -> Vec<ConversationMessage> {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| ConversationMessage {
            role: m.role,
            content: MessageContent::Text(m.content.clone()),
        })
        .collect()
}
