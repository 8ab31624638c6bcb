use serde::{Deserialize, Serialize};

use crate::tools::Row;

/// Outcome of one `execute_sql` invocation, as shown in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Matches the model's tool invocation id.
    pub tool_call_id: String,
    pub sql: String,
    pub columns: Vec<String>,
    /// Truncated to the configured maximum.
    pub rows: Vec<Row>,
    /// Total rows the statement produced, before truncation.
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn failed(tool_call_id: impl Into<String>, sql: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            sql: sql.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            error: Some(error.into()),
        }
    }
}

/// Events emitted by the agent loop during one turn.
///
/// A turn produces text chunks and tool-call/tool-result pairs, then exactly
/// one of `Done` or `Error`. A cancelled turn ends without either.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Incremental model text.
    TextChunk { text: String },
    /// A tool invocation is about to run.
    ToolCall { id: String, sql: String },
    /// A tool invocation finished.
    ToolResult(ToolCallResult),
    /// The model produced its final answer.
    Done,
    /// The turn failed.
    Error { message: String },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done | AgentEvent::Error { .. })
    }
}
