//! Offline client that replays canned rounds. Used by tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use super::{
    ContentBlock, FinalMessage, LlmClient, LlmError, MessageRequest, MessageStream, StopReason,
    StreamEvent,
};
use crate::tools::EXECUTE_SQL;

/// One canned provider response.
#[derive(Debug)]
pub enum ScriptedRound {
    /// Stream `chunks` as text deltas, then complete with `message`.
    Respond {
        chunks: Vec<String>,
        message: FinalMessage,
    },
    /// Fail to open the stream.
    Fail(LlmError),
    /// Stream `chunks`, then break off with an error.
    Interrupted { chunks: Vec<String>, error: LlmError },
}

impl ScriptedRound {
    /// A final answer streamed as the given chunks.
    pub fn answer(chunks: &[&str]) -> Self {
        let text: String = chunks.concat();
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentBlock::Text { text }]
        };
        Self::Respond {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            message: FinalMessage {
                stop_reason: Some(StopReason::EndTurn),
                content,
            },
        }
    }

    /// Optional leading text followed by `execute_sql` invocations `(id, sql)`.
    pub fn tool_calls(chunks: &[&str], calls: &[(&str, &str)]) -> Self {
        let text: String = chunks.concat();
        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
        content.extend(calls.iter().map(|(id, sql)| ContentBlock::ToolUse {
            id: id.to_string(),
            name: EXECUTE_SQL.to_string(),
            input: json!({ "sql": sql }),
        }));
        Self::Respond {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            message: FinalMessage {
                stop_reason: Some(StopReason::ToolUse),
                content,
            },
        }
    }
}

/// Replays [`ScriptedRound`]s in order and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    rounds: Mutex<VecDeque<ScriptedRound>>,
    requests: Mutex<Vec<MessageRequest>>,
}

impl ScriptedClient {
    pub fn new(rounds: Vec<ScriptedRound>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<MessageRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn stream_message(
        &self,
        _credential: &str,
        request: &MessageRequest,
    ) -> Result<MessageStream, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let round = self
            .rounds
            .lock()
            .ok()
            .and_then(|mut rounds| rounds.pop_front())
            .ok_or_else(|| LlmError::Transport("no scripted response left".to_string()))?;

        let events: Vec<Result<StreamEvent, LlmError>> = match round {
            ScriptedRound::Fail(error) => return Err(error),
            ScriptedRound::Respond { chunks, message } => {
                let mut events = vec![Ok(StreamEvent::BlockStart { index: 0 })];
                events.extend(chunks.into_iter().map(|c| Ok(StreamEvent::TextDelta(c))));
                events.push(Ok(StreamEvent::BlockStop { index: 0 }));
                events.push(Ok(StreamEvent::Completed(message)));
                events
            }
            ScriptedRound::Interrupted { chunks, error } => {
                let mut events: Vec<_> = chunks
                    .into_iter()
                    .map(|c| Ok(StreamEvent::TextDelta(c)))
                    .collect();
                events.push(Err(error));
                events
            }
        };

        Ok(Box::pin(futures::stream::iter(events)))
    }
}
