//! Streaming client for the Anthropic Messages API.

use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{retry, Event, RequestBuilderExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    ContentBlock, FinalMessage, LlmClient, LlmError, MessageRequest, MessageStream, StopReason,
    StreamEvent,
};

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    async fn stream_message(
        &self,
        credential: &str,
        request: &MessageRequest,
    ) -> Result<MessageStream, LlmError> {
        let url = self.messages_url();
        debug!(
            url = %url,
            model = %request.model,
            message_count = request.messages.len(),
            "Opening message stream"
        );

        let mut es = self
            .client
            .post(&url)
            .header("x-api-key", credential)
            .header("anthropic-version", API_VERSION)
            .json(request)
            .eventsource()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        es.set_retry_policy(Box::new(retry::Never));

        let stream = async_stream::stream! {
            let mut acc = MessageAccumulator::default();
            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(message)) => match acc.push(&message.data) {
                        Ok(items) => {
                            for item in items {
                                yield Ok(item);
                            }
                            if acc.is_complete() {
                                break;
                            }
                        }
                        Err(e) => {
                            es.close();
                            yield Err(e);
                            return;
                        }
                    },
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                        es.close();
                        let body = response.text().await.unwrap_or_default();
                        yield Err(LlmError::Status {
                            status: status.as_u16(),
                            body: provider_error_message(&body).unwrap_or(body),
                        });
                        return;
                    }
                    Err(e) => {
                        es.close();
                        yield Err(LlmError::Transport(e.to_string()));
                        return;
                    }
                }
            }
            es.close();
            if !acc.is_complete() {
                yield Err(LlmError::MalformedStream(
                    "stream ended before message_stop".to_string(),
                ));
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Extract the human-readable message from an error body like
/// `{"type":"error","error":{"type":"authentication_error","message":"..."}}`.
fn provider_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .or_else(|| parsed.get("message").and_then(|m| m.as_str()))
        .map(|s| s.to_string())
}

// ── SSE payloads ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        #[allow(dead_code)]
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: WireMessageDelta,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<StopReason>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

// ── Reconstruction ────────────────────────────────────────────────

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
        json: String,
    },
    Ignored,
}

/// Folds SSE payloads into incremental [`StreamEvent`]s and, once
/// `message_stop` arrives, the finalized message.
///
/// Tool input arrives as partial JSON fragments; it is only parsed when its
/// block closes, since fragments are not valid JSON on their own.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    blocks: Vec<Option<PartialBlock>>,
    stop_reason: Option<StopReason>,
    complete: bool,
}

impl MessageAccumulator {
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Consume one SSE `data` payload.
    pub fn push(&mut self, data: &str) -> Result<Vec<StreamEvent>, LlmError> {
        if self.complete {
            return Ok(Vec::new());
        }

        let event: WireEvent = serde_json::from_str(data)
            .map_err(|e| LlmError::MalformedStream(format!("{}: {}", e, data)))?;

        let mut out = Vec::new();
        match event {
            WireEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    WireBlock::Text { text } => PartialBlock::Text(text),
                    WireBlock::ToolUse { id, name, input } => PartialBlock::ToolUse {
                        id,
                        name,
                        input,
                        json: String::new(),
                    },
                    WireBlock::Other => PartialBlock::Ignored,
                };
                if self.blocks.len() <= index {
                    self.blocks.resize_with(index + 1, || None);
                }
                self.blocks[index] = Some(block);
                out.push(StreamEvent::BlockStart { index });
            }
            WireEvent::ContentBlockDelta { index, delta } => {
                let block = self
                    .blocks
                    .get_mut(index)
                    .and_then(|b| b.as_mut())
                    .ok_or_else(|| {
                        LlmError::MalformedStream(format!("delta for unopened block {}", index))
                    })?;
                match (block, delta) {
                    (PartialBlock::Text(text), WireDelta::TextDelta { text: fragment }) => {
                        text.push_str(&fragment);
                        if !fragment.is_empty() {
                            out.push(StreamEvent::TextDelta(fragment));
                        }
                    }
                    (PartialBlock::ToolUse { json, .. }, WireDelta::InputJsonDelta { partial_json }) => {
                        json.push_str(&partial_json);
                    }
                    _ => {}
                }
            }
            WireEvent::ContentBlockStop { index } => {
                if let Some(Some(PartialBlock::ToolUse { input, json, .. })) =
                    self.blocks.get_mut(index)
                {
                    if !json.trim().is_empty() {
                        *input = serde_json::from_str(json).map_err(|e| {
                            LlmError::MalformedStream(format!("invalid tool input JSON: {}", e))
                        })?;
                    }
                }
                out.push(StreamEvent::BlockStop { index });
            }
            WireEvent::MessageDelta { delta } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
            }
            WireEvent::MessageStop => {
                self.complete = true;
                out.push(StreamEvent::Completed(self.final_message()));
            }
            WireEvent::Error { error } => {
                return Err(LlmError::Provider {
                    kind: error.kind,
                    message: error.message,
                });
            }
            WireEvent::MessageStart { .. } | WireEvent::Ping | WireEvent::Unknown => {}
        }
        Ok(out)
    }

    fn final_message(&self) -> FinalMessage {
        let content = self
            .blocks
            .iter()
            .flatten()
            .filter_map(|block| match block {
                PartialBlock::Text(text) => Some(ContentBlock::Text { text: text.clone() }),
                PartialBlock::ToolUse { id, name, input, .. } => Some(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: if input.is_null() {
                        Value::Object(Default::default())
                    } else {
                        input.clone()
                    },
                }),
                PartialBlock::Ignored => None,
            })
            .collect();
        FinalMessage {
            stop_reason: self.stop_reason,
            content,
        }
    }
}
