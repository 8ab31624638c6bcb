//! Folds agent events into an assistant [`ChatMessage`].
//!
//! Text chunks are buffered and flushed into `content` at most once per
//! flush interval. Tool calls and terminal events force a flush first, so a
//! segment is only ever closed over text that is already in `content`.

use std::mem;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::debug;

use super::{ChatMessage, ContentSegment};
use crate::agent::AgentEvent;

/// What applying an event did to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Text was buffered; the message is unchanged.
    Buffered,
    /// The message changed.
    Updated,
    /// The message changed and the schema may have too.
    RefreshSchema,
    /// The turn is finished; the message is final.
    Settled,
}

#[derive(Debug, Clone, Copy)]
enum SegmentKind {
    Thinking,
    Answer,
}

/// Per-turn reducer state.
#[derive(Debug)]
pub struct TurnReducer {
    flush_interval: Duration,
    /// Text received but not yet visible in `content`.
    buffer: String,
    flush_deadline: Option<Instant>,
    /// Text visible in `content` but not yet part of a segment.
    unsegmented: String,
    segments: Vec<ContentSegment>,
}

impl TurnReducer {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            flush_interval,
            buffer: String::new(),
            flush_deadline: None,
            unsegmented: String::new(),
            segments: Vec::new(),
        }
    }

    /// When the pending buffer is due to be flushed, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    pub fn segments(&self) -> &[ContentSegment] {
        &self.segments
    }

    pub fn apply(&mut self, event: AgentEvent, message: &mut ChatMessage, now: Instant) -> Effect {
        match event {
            AgentEvent::TextChunk { text } => {
                self.append(&text, now);
                Effect::Buffered
            }
            AgentEvent::ToolCall { .. } => {
                self.force_flush(message);
                // Whitespace-only text rides along into the next segment.
                if !self.unsegmented.trim().is_empty() {
                    self.close_segment(SegmentKind::Thinking);
                    message.segments = Some(self.segments.clone());
                }
                Effect::Updated
            }
            AgentEvent::ToolResult(result) => {
                self.segments.push(ContentSegment::Tool {
                    tool_result: result.clone(),
                });
                message.tool_calls.get_or_insert_with(Vec::new).push(result);
                message.segments = Some(self.segments.clone());
                Effect::RefreshSchema
            }
            AgentEvent::Done => {
                self.settle(message);
                Effect::Settled
            }
            AgentEvent::Error { message: error } => {
                self.settle(message);
                message.content.push_str(&format!("\n\n**Error:** {}", error));
                Effect::Settled
            }
        }
    }

    /// Flush the buffer if its deadline has passed. Returns whether it did.
    pub fn flush_due(&mut self, message: &mut ChatMessage, now: Instant) -> bool {
        match self.flush_deadline {
            Some(deadline) if deadline <= now => {
                self.flush_deadline = None;
                self.flush(message)
            }
            _ => false,
        }
    }

    /// Finalize a turn whose event stream ended without `Done` or `Error`.
    pub fn finish(&mut self, message: &mut ChatMessage) {
        self.settle(message);
    }

    fn append(&mut self, chunk: &str, now: Instant) {
        self.buffer.push_str(chunk);
        if self.flush_deadline.is_none() {
            self.flush_deadline = Some(now + self.flush_interval);
        }
    }

    /// Cancel any pending deadline, then flush.
    fn force_flush(&mut self, message: &mut ChatMessage) {
        self.flush_deadline = None;
        self.flush(message);
    }

    fn flush(&mut self, message: &mut ChatMessage) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        let text = mem::take(&mut self.buffer);
        self.unsegmented.push_str(&text);
        message.content.push_str(&text);
        true
    }

    fn close_segment(&mut self, kind: SegmentKind) {
        let text = mem::take(&mut self.unsegmented);
        self.segments.push(match kind {
            SegmentKind::Thinking => ContentSegment::Thinking { text },
            SegmentKind::Answer => ContentSegment::Answer { text },
        });
    }

    fn settle(&mut self, message: &mut ChatMessage) {
        self.force_flush(message);
        if !self.unsegmented.is_empty() {
            self.close_segment(SegmentKind::Answer);
        }
        message.segments = Some(self.segments.clone());
        message.is_streaming = false;
    }
}

/// Where a turn's assistant message is published.
#[async_trait]
pub trait TurnSink: Send + Sync {
    /// Store the latest state of the message. Returns `false` once the
    /// message no longer exists (the session was cleared).
    async fn publish(&self, message: &ChatMessage) -> bool;

    /// Tables may have changed; reload the schema snapshot.
    fn refresh_schema(&self);
}

/// Consume a turn's events until it settles, publishing every visible change.
///
/// The flush deadline and incoming events are handled by this one task, so a
/// forced flush always clears the deadline before a late timer could fire.
pub async fn drive_turn(
    mut reducer: TurnReducer,
    mut message: ChatMessage,
    mut events: UnboundedReceiver<AgentEvent>,
    sink: &dyn TurnSink,
) -> ChatMessage {
    loop {
        let deadline = reducer.deadline();
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if reducer.flush_due(&mut message, Instant::now()) && !sink.publish(&message).await {
                    break;
                }
                continue;
            }
        };

        let Some(event) = event else {
            debug!(message_id = %message.id, "Turn ended without a terminal event");
            reducer.finish(&mut message);
            sink.publish(&message).await;
            break;
        };

        match reducer.apply(event, &mut message, Instant::now()) {
            Effect::Buffered => {}
            Effect::Updated => {
                if !sink.publish(&message).await {
                    break;
                }
            }
            Effect::RefreshSchema => {
                sink.refresh_schema();
                if !sink.publish(&message).await {
                    break;
                }
            }
            Effect::Settled => {
                sink.publish(&message).await;
                break;
            }
        }
    }
    message
}
