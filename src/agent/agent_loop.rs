//! Core agent loop implementation.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::llm::{
    ContentBlock, ConversationMessage, FinalMessage, LlmClient, LlmError, MessageRequest, Role,
    StopReason, StreamEvent,
};
use crate::tools::{execute_sql_tool, QueryError, Row, SqlExecutor, TableInfo, EXECUTE_SQL};

use super::events::{AgentEvent, ToolCallResult};
use super::prompt::build_system_prompt;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// `Done` was emitted.
    Completed,
    /// `Error` was emitted.
    Failed,
    /// The turn was cancelled; no terminal event was emitted.
    Cancelled,
}

/// Everything a single turn needs besides the agent itself.
pub struct TurnContext<'a> {
    pub credential: &'a str,
    pub history: Vec<ConversationMessage>,
    pub tables: &'a [TableInfo],
    pub executor: &'a dyn SqlExecutor,
    pub events: &'a UnboundedSender<AgentEvent>,
    pub cancel: &'a CancellationToken,
}

/// The SQL analyst agent.
///
/// # Algorithm
/// 1. Stream a request with the system prompt, the `execute_sql` tool and the history
/// 2. Forward text deltas as they arrive
/// 3. If the model stopped for tool use: run each invocation in order, append the
///    assistant turn and one user turn of results, repeat
/// 4. Otherwise emit `Done`
///
/// Query failures are fed back to the model as error results; only provider
/// failures end the turn with `Error`.
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    config: AgentConfig,
}

struct Round {
    text: String,
    message: FinalMessage,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultPayload<'a> {
    columns: &'a [String],
    rows: &'a [Row],
    total_rows: usize,
}

impl Agent {
    pub fn new(llm: Arc<dyn LlmClient>, config: AgentConfig) -> Self {
        Self { llm, config }
    }

    /// Drive one user turn to completion.
    ///
    /// Never fails: provider errors become an `Error` event, cancellation
    /// returns without a terminal event.
    pub async fn run_turn(&self, ctx: TurnContext<'_>) -> TurnOutcome {
        let TurnContext {
            credential,
            mut history,
            tables,
            executor,
            events,
            cancel,
        } = ctx;

        let system = build_system_prompt(tables);
        let tools = vec![execute_sql_tool()];

        for round in 0..self.config.max_rounds {
            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            debug!(round = round + 1, messages = history.len(), "Agent round");

            let request = MessageRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
                system: system.clone(),
                tools: tools.clone(),
                messages: history.clone(),
                stream: true,
            };

            let Round { text, message } =
                match self.stream_round(credential, &request, events, cancel).await {
                    Ok(Some(round)) => round,
                    Ok(None) => return TurnOutcome::Cancelled,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            return TurnOutcome::Cancelled;
                        }
                        warn!(error = %e, "Model request failed");
                        emit(events, AgentEvent::Error { message: e.to_string() });
                        return TurnOutcome::Failed;
                    }
                };

            let tool_uses = message.tool_uses();
            if message.stop_reason != Some(StopReason::ToolUse) || tool_uses.is_empty() {
                debug!(round = round + 1, stop_reason = ?message.stop_reason, "Turn complete");
                emit(events, AgentEvent::Done);
                return TurnOutcome::Completed;
            }

            let mut assistant = Vec::with_capacity(tool_uses.len() + 1);
            if !text.is_empty() {
                assistant.push(ContentBlock::Text { text });
            }
            assistant.extend(tool_uses.iter().cloned());
            history.push(ConversationMessage::blocks(Role::Assistant, assistant));

            // Sequential on purpose: results must follow invocation order.
            let mut results = Vec::with_capacity(tool_uses.len());
            for block in &tool_uses {
                let ContentBlock::ToolUse { id, name, input } = block else {
                    continue;
                };
                match self.run_tool(id, name, input, executor, events, cancel).await {
                    Some(result) => results.push(result),
                    None => return TurnOutcome::Cancelled,
                }
            }
            history.push(ConversationMessage::blocks(Role::User, results));
        }

        info!(max_rounds = self.config.max_rounds, "Round limit reached");
        emit(
            events,
            AgentEvent::Error {
                message: format!(
                    "Stopped after {} rounds without a final answer",
                    self.config.max_rounds
                ),
            },
        );
        TurnOutcome::Failed
    }

    /// Stream one response, forwarding text. `Ok(None)` means cancelled.
    async fn stream_round(
        &self,
        credential: &str,
        request: &MessageRequest,
        events: &UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<Option<Round>, LlmError> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            opened = self.llm.stream_message(credential, request) => opened?,
        };

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(StreamEvent::TextDelta(fragment))) => {
                    text.push_str(&fragment);
                    emit(events, AgentEvent::TextChunk { text: fragment });
                }
                Some(Ok(StreamEvent::Completed(message))) => {
                    return Ok(Some(Round { text, message }));
                }
                Some(Ok(StreamEvent::BlockStart { .. } | StreamEvent::BlockStop { .. })) => {}
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(LlmError::MalformedStream(
                        "stream ended without a final message".to_string(),
                    ))
                }
            }
        }
    }

    /// Run one invocation and build its result block. `None` means cancelled.
    async fn run_tool(
        &self,
        id: &str,
        name: &str,
        input: &Value,
        executor: &dyn SqlExecutor,
        events: &UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Option<ContentBlock> {
        let sql = input.get("sql").and_then(Value::as_str);
        emit(
            events,
            AgentEvent::ToolCall {
                id: id.to_string(),
                sql: sql.unwrap_or_default().to_string(),
            },
        );

        let outcome = match (name, sql) {
            (EXECUTE_SQL, Some(sql)) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = executor.execute(sql) => result,
            },
            (EXECUTE_SQL, None) => Err(QueryError::new("Missing 'sql' argument")),
            (other, _) => Err(QueryError::new(format!("Unknown tool: {}", other))),
        };

        if cancel.is_cancelled() {
            return None;
        }

        let sql = sql.unwrap_or_default().to_string();
        let block = match outcome {
            Ok(output) => {
                let max = self.config.max_result_rows;
                let total = output.row_count;
                let rows: Vec<Row> = output.rows.into_iter().take(max).collect();

                let mut content = serde_json::to_string(&ToolResultPayload {
                    columns: &output.columns,
                    rows: &rows,
                    total_rows: total,
                })
                .unwrap_or_else(|_| "{}".to_string());
                if total > max {
                    content.push_str(&format!("\n(Showing first {} of {} rows)", max, total));
                }

                debug!(tool_call_id = %id, rows = total, "Query succeeded");
                emit(
                    events,
                    AgentEvent::ToolResult(ToolCallResult {
                        tool_call_id: id.to_string(),
                        sql,
                        columns: output.columns,
                        rows,
                        row_count: total,
                        error: None,
                    }),
                );

                ContentBlock::ToolResult {
                    tool_use_id: id.to_string(),
                    content,
                    is_error: false,
                }
            }
            Err(e) => {
                debug!(tool_call_id = %id, error = %e, "Query failed");
                emit(
                    events,
                    AgentEvent::ToolResult(ToolCallResult::failed(id, sql, e.message.clone())),
                );
                ContentBlock::ToolResult {
                    tool_use_id: id.to_string(),
                    content: format!("Error: {}", e.message),
                    is_error: true,
                }
            }
        };

        Some(block)
    }
}

fn emit(events: &UnboundedSender<AgentEvent>, event: AgentEvent) {
    // A dropped receiver means nobody is listening any more; the turn still
    // runs to its natural end.
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::llm::{MessageContent, ScriptedClient, ScriptedRound};
    use crate::tools::QueryOutput;

    #[derive(Default)]
    struct FakeExecutor {
        results: HashMap<String, Result<QueryOutput, QueryError>>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn with(mut self, sql: &str, result: Result<QueryOutput, QueryError>) -> Self {
            self.results.insert(sql.to_string(), result);
            self
        }

        fn delayed(mut self, sql: &str, delay: Duration) -> Self {
            self.delays.insert(sql.to_string(), delay);
            self
        }
    }

    #[async_trait]
    impl SqlExecutor for FakeExecutor {
        async fn execute(&self, sql: &str) -> Result<QueryOutput, QueryError> {
            self.calls.lock().unwrap().push(sql.to_string());
            if let Some(delay) = self.delays.get(sql) {
                tokio::time::sleep(*delay).await;
            }
            self.results
                .get(sql)
                .cloned()
                .unwrap_or_else(|| Err(QueryError::new(format!("unexpected query: {}", sql))))
        }
    }

    fn rows(n: usize) -> QueryOutput {
        QueryOutput {
            columns: vec!["n".to_string()],
            rows: (0..n)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("n".to_string(), json!(i));
                    row
                })
                .collect(),
            row_count: n,
        }
    }

    async fn run(
        client: Arc<ScriptedClient>,
        executor: &FakeExecutor,
        config: AgentConfig,
    ) -> (TurnOutcome, Vec<AgentEvent>) {
        let agent = Agent::new(client, config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let outcome = agent
            .run_turn(TurnContext {
                credential: "sk-test",
                history: vec![ConversationMessage::user_text("question")],
                tables: &[],
                executor,
                events: &tx,
                cancel: &cancel,
            })
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn plain_answer_emits_chunks_then_done() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedRound::answer(&[
            "There are ",
            "42 rows.",
        ])]));
        let (outcome, events) = run(client.clone(), &FakeExecutor::default(), AgentConfig::default()).await;

        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(
            events,
            vec![
                AgentEvent::TextChunk { text: "There are ".to_string() },
                AgentEvent::TextChunk { text: "42 rows.".to_string() },
                AgentEvent::Done,
            ]
        );
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn request_carries_model_tool_and_system_prompt() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedRound::answer(&["ok"])]));
        run(client.clone(), &FakeExecutor::default(), AgentConfig::default()).await;

        let request = &client.requests()[0];
        assert_eq!(request.model, crate::config::DEFAULT_MODEL);
        assert_eq!(request.max_tokens, 4096);
        assert!(request.stream);
        assert_eq!(request.tools, vec![execute_sql_tool()]);
        assert!(request.system.contains("No tables are currently loaded"));
        assert_eq!(request.messages, vec![ConversationMessage::user_text("question")]);
    }

    #[tokio::test]
    async fn tool_use_without_invocations_terminates() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedRound::Respond {
            chunks: vec!["hmm".to_string()],
            message: FinalMessage {
                stop_reason: Some(StopReason::ToolUse),
                content: vec![ContentBlock::Text { text: "hmm".to_string() }],
            },
        }]));
        let (outcome, events) = run(client.clone(), &FakeExecutor::default(), AgentConfig::default()).await;

        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(events.last(), Some(&AgentEvent::Done));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn other_stop_reason_ignores_tool_blocks() {
        let mut round = ScriptedRound::tool_calls(&[], &[("t1", "SELECT 1")]);
        if let ScriptedRound::Respond { message, .. } = &mut round {
            message.stop_reason = Some(StopReason::MaxTokens);
        }
        let client = Arc::new(ScriptedClient::new(vec![round]));
        let executor = FakeExecutor::default();
        let (outcome, events) = run(client.clone(), &executor, AgentConfig::default()).await;

        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(events, vec![AgentEvent::Done]);
        assert!(executor.calls.lock().unwrap().is_empty());
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn tool_round_appends_one_assistant_and_one_user_entry() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::tool_calls(&["Checking."], &[("t1", "SELECT a"), ("t2", "SELECT b")]),
            ScriptedRound::answer(&["Done."]),
        ]));
        let executor = FakeExecutor::default()
            .with("SELECT a", Ok(rows(1)))
            .with("SELECT b", Ok(rows(2)));
        let (outcome, _) = run(client.clone(), &executor, AgentConfig::default()).await;
        assert_eq!(outcome, TurnOutcome::Completed);

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        assert_eq!(second.len(), 3);

        assert_eq!(second[1].role, Role::Assistant);
        let MessageContent::Blocks(assistant) = &second[1].content else {
            panic!("assistant entry should carry blocks");
        };
        assert_eq!(assistant[0], ContentBlock::Text { text: "Checking.".to_string() });
        assert!(matches!(&assistant[1], ContentBlock::ToolUse { id, .. } if id == "t1"));
        assert!(matches!(&assistant[2], ContentBlock::ToolUse { id, .. } if id == "t2"));

        assert_eq!(second[2].role, Role::User);
        let MessageContent::Blocks(results) = &second[2].content else {
            panic!("user entry should carry blocks");
        };
        let ids: Vec<_> = results
            .iter()
            .map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
                other => panic!("unexpected block {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn assistant_entry_omits_empty_text() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::tool_calls(&[], &[("t1", "SELECT a")]),
            ScriptedRound::answer(&["ok"]),
        ]));
        let executor = FakeExecutor::default().with("SELECT a", Ok(rows(1)));
        run(client.clone(), &executor, AgentConfig::default()).await;

        let MessageContent::Blocks(assistant) = &client.requests()[1].messages[1].content else {
            panic!("assistant entry should carry blocks");
        };
        assert_eq!(assistant.len(), 1);
        assert!(matches!(assistant[0], ContentBlock::ToolUse { .. }));
    }

    #[tokio::test]
    async fn results_follow_invocation_order_despite_timing() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::tool_calls(&[], &[("slow", "SELECT slow"), ("fast", "SELECT fast")]),
            ScriptedRound::answer(&["ok"]),
        ]));
        let executor = FakeExecutor::default()
            .with("SELECT slow", Ok(rows(1)))
            .with("SELECT fast", Ok(rows(1)))
            .delayed("SELECT slow", Duration::from_millis(30));
        let (_, events) = run(client, &executor, AgentConfig::default()).await;

        let order: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolCall { id, .. } => Some(format!("call:{}", id)),
                AgentEvent::ToolResult(r) => Some(format!("result:{}", r.tool_call_id)),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec!["call:slow", "result:slow", "call:fast", "result:fast"]
        );
        assert_eq!(
            *executor.calls.lock().unwrap(),
            vec!["SELECT slow".to_string(), "SELECT fast".to_string()]
        );
    }

    #[tokio::test]
    async fn large_results_are_truncated_with_note() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::tool_calls(&[], &[("t1", "SELECT big")]),
            ScriptedRound::answer(&["ok"]),
        ]));
        let executor = FakeExecutor::default().with("SELECT big", Ok(rows(250)));
        let (_, events) = run(client.clone(), &executor, AgentConfig::default()).await;

        let result = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolResult(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(result.rows.len(), 100);
        assert_eq!(result.row_count, 250);
        assert!(result.error.is_none());

        let MessageContent::Blocks(blocks) = &client.requests()[1].messages[2].content else {
            panic!("user entry should carry blocks");
        };
        let ContentBlock::ToolResult { content, is_error, .. } = &blocks[0] else {
            panic!("expected tool result");
        };
        assert!(!is_error);
        assert!(content.ends_with("\n(Showing first 100 of 250 rows)"));
        let json_part = content.split('\n').next().unwrap();
        let payload: Value = serde_json::from_str(json_part).unwrap();
        assert_eq!(payload["totalRows"], json!(250));
        assert_eq!(payload["rows"].as_array().unwrap().len(), 100);
        assert_eq!(payload["columns"], json!(["n"]));
    }

    #[tokio::test]
    async fn small_results_have_no_truncation_note() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::tool_calls(&[], &[("t1", "SELECT COUNT(*) AS cnt FROM orders")]),
            ScriptedRound::answer(&["There are 42 rows."]),
        ]));
        let mut row = Row::new();
        row.insert("cnt".to_string(), json!(42));
        let executor = FakeExecutor::default().with(
            "SELECT COUNT(*) AS cnt FROM orders",
            Ok(QueryOutput {
                columns: vec!["cnt".to_string()],
                rows: vec![row],
                row_count: 1,
            }),
        );
        run(client.clone(), &executor, AgentConfig::default()).await;

        let MessageContent::Blocks(blocks) = &client.requests()[1].messages[2].content else {
            panic!("user entry should carry blocks");
        };
        assert_eq!(
            blocks[0],
            ContentBlock::ToolResult {
                tool_use_id: "t1".to_string(),
                content: r#"{"columns":["cnt"],"rows":[{"cnt":42}],"totalRows":1}"#.to_string(),
                is_error: false,
            }
        );
    }

    #[tokio::test]
    async fn query_failure_is_fed_back_and_loop_continues() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::tool_calls(&[], &[("t1", "SELECT * FROM ordrs")]),
            ScriptedRound::answer(&["Fixed it."]),
        ]));
        let executor = FakeExecutor::default()
            .with("SELECT * FROM ordrs", Err(QueryError::new("Table not found: ordrs")));
        let (outcome, events) = run(client.clone(), &executor, AgentConfig::default()).await;

        assert_eq!(outcome, TurnOutcome::Completed);
        assert!(events.contains(&AgentEvent::ToolResult(ToolCallResult::failed(
            "t1",
            "SELECT * FROM ordrs",
            "Table not found: ordrs"
        ))));

        let MessageContent::Blocks(blocks) = &client.requests()[1].messages[2].content else {
            panic!("user entry should carry blocks");
        };
        assert_eq!(
            blocks[0],
            ContentBlock::ToolResult {
                tool_use_id: "t1".to_string(),
                content: "Error: Table not found: ordrs".to_string(),
                is_error: true,
            }
        );
    }

    #[tokio::test]
    async fn missing_sql_argument_is_a_tool_error() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::Respond {
                chunks: vec![],
                message: FinalMessage {
                    stop_reason: Some(StopReason::ToolUse),
                    content: vec![ContentBlock::ToolUse {
                        id: "t1".to_string(),
                        name: EXECUTE_SQL.to_string(),
                        input: json!({"query": "SELECT 1"}),
                    }],
                },
            },
            ScriptedRound::answer(&["ok"]),
        ]));
        let executor = FakeExecutor::default();
        let (_, events) = run(client, &executor, AgentConfig::default()).await;

        assert_eq!(
            events[0],
            AgentEvent::ToolCall { id: "t1".to_string(), sql: String::new() }
        );
        assert!(matches!(&events[1], AgentEvent::ToolResult(r) if r.error.as_deref() == Some("Missing 'sql' argument")));
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_emits_single_error() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedRound::Fail(LlmError::Status {
            status: 401,
            body: "invalid x-api-key".to_string(),
        })]));
        let (outcome, events) = run(client.clone(), &FakeExecutor::default(), AgentConfig::default()).await;

        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(
            events,
            vec![AgentEvent::Error { message: "Provider returned 401: invalid x-api-key".to_string() }]
        );
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn broken_stream_keeps_streamed_text_then_errors() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedRound::Interrupted {
            chunks: vec!["partial".to_string()],
            error: LlmError::Transport("connection reset".to_string()),
        }]));
        let (outcome, events) = run(client, &FakeExecutor::default(), AgentConfig::default()).await;

        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(
            events,
            vec![
                AgentEvent::TextChunk { text: "partial".to_string() },
                AgentEvent::Error { message: "Request failed: connection reset".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn round_limit_stops_runaway_tool_use() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::tool_calls(&[], &[("t1", "SELECT a")]),
            ScriptedRound::tool_calls(&[], &[("t2", "SELECT a")]),
            ScriptedRound::answer(&["never reached"]),
        ]));
        let executor = FakeExecutor::default().with("SELECT a", Ok(rows(1)));
        let config = AgentConfig {
            max_rounds: 2,
            ..AgentConfig::default()
        };
        let (outcome, events) = run(client.clone(), &executor, config).await;

        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(
            events.last(),
            Some(&AgentEvent::Error {
                message: "Stopped after 2 rounds without a final answer".to_string()
            })
        );
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_request_emits_nothing() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedRound::answer(&["hi"])]));
        let agent = Agent::new(client.clone(), AgentConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = agent
            .run_turn(TurnContext {
                credential: "sk-test",
                history: vec![ConversationMessage::user_text("q")],
                tables: &[],
                executor: &FakeExecutor::default(),
                events: &tx,
                cancel: &cancel,
            })
            .await;
        drop(tx);

        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert!(rx.recv().await.is_none());
        assert!(client.requests().is_empty());
    }

    /// Cancels as soon as the stream is opened, before any chunk is consumed.
    struct CancelOnOpen {
        inner: ScriptedClient,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl LlmClient for CancelOnOpen {
        async fn stream_message(
            &self,
            credential: &str,
            request: &MessageRequest,
        ) -> Result<crate::llm::MessageStream, LlmError> {
            let stream = self.inner.stream_message(credential, request).await;
            self.cancel.cancel();
            stream
        }
    }

    #[tokio::test]
    async fn cancelled_after_dispatch_emits_nothing_further() {
        let cancel = CancellationToken::new();
        let client = Arc::new(CancelOnOpen {
            inner: ScriptedClient::new(vec![
                ScriptedRound::tool_calls(&["thinking"], &[("t1", "SELECT a")]),
                ScriptedRound::answer(&["never"]),
            ]),
            cancel: cancel.clone(),
        });
        let executor = FakeExecutor::default().with("SELECT a", Ok(rows(1)));
        let agent = Agent::new(client.clone(), AgentConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = agent
            .run_turn(TurnContext {
                credential: "sk-test",
                history: vec![ConversationMessage::user_text("q")],
                tables: &[],
                executor: &executor,
                events: &tx,
                cancel: &cancel,
            })
            .await;
        drop(tx);

        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert!(rx.recv().await.is_none());
        assert_eq!(client.inner.requests().len(), 1);
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_running_query() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedRound::tool_calls(&[], &[("t1", "SELECT slow")]),
            ScriptedRound::answer(&["never"]),
        ]));
        let executor = FakeExecutor::default()
            .with("SELECT slow", Ok(rows(1)))
            .delayed("SELECT slow", Duration::from_secs(3600));
        let agent = Agent::new(client.clone(), AgentConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let turn = async {
            let outcome = agent
                .run_turn(TurnContext {
                    credential: "sk-test",
                    history: vec![ConversationMessage::user_text("q")],
                    tables: &[],
                    executor: &executor,
                    events: &tx,
                    cancel: &cancel,
                })
                .await;
            drop(tx);
            outcome
        };
        let stopper = async {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                if matches!(event, AgentEvent::ToolCall { .. }) {
                    cancel.cancel();
                }
                seen.push(event);
            }
            seen
        };
        let (outcome, events) = tokio::join!(turn, stopper);

        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(
            events,
            vec![AgentEvent::ToolCall {
                id: "t1".to_string(),
                sql: "SELECT slow".to_string()
            }]
        );
        assert_eq!(client.requests().len(), 1);
    }
}
