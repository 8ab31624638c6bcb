//! Session state: the transcript, the in-flight turn, and the credential.
//!
//! A [`Session`] is cheap to clone; clones share state. At most one turn runs
//! at a time. Each turn is spawned as a task that drives the agent and the
//! transcript reducer side by side and writes snapshots back into the
//! session through [`TurnSink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, TurnContext};
use crate::llm::ConversationMessage;
use crate::tools::{QueryError, QueryOutput, SchemaCatalog, SqlExecutor, TableInfo};
use crate::transcript::{conversation_history, drive_turn, ChatMessage, TurnReducer, TurnSink};

/// Reasons a message cannot be sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("A response is already streaming")]
    TurnInFlight,

    #[error("No API key has been provided")]
    MissingCredential,

    #[error("Message text is empty")]
    EmptyMessage,
}

/// Change notifications fanned out to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionUpdate {
    /// A message was added or changed; carries the full snapshot.
    MessageUpdated { message: ChatMessage },
    /// The in-flight turn ended.
    #[serde(rename_all = "camelCase")]
    TurnFinished { message_id: String },
    /// The session was reset.
    Cleared,
}

impl SessionUpdate {
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionUpdate::MessageUpdated { .. } => "message",
            SessionUpdate::TurnFinished { .. } => "turn_finished",
            SessionUpdate::Cleared => "cleared",
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    messages: Vec<ChatMessage>,
    is_streaming: bool,
    credential: Option<String>,
    cancel: Option<CancellationToken>,
    /// Bumped on clear so a stale turn cannot write into the new session.
    generation: u64,
}

struct Inner {
    state: RwLock<SessionState>,
    tables: RwLock<Vec<TableInfo>>,
    agent: Agent,
    executor: Arc<dyn SqlExecutor>,
    catalog: Arc<dyn SchemaCatalog>,
    updates: broadcast::Sender<SessionUpdate>,
    flush_interval: Duration,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(
        agent: Agent,
        executor: Arc<dyn SqlExecutor>,
        catalog: Arc<dyn SchemaCatalog>,
        flush_interval: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(SessionState::default()),
                tables: RwLock::new(Vec::new()),
                agent,
                executor,
                catalog,
                updates,
                flush_interval,
            }),
        }
    }

    pub async fn set_credential(&self, credential: impl Into<String>) {
        self.inner.state.write().await.credential = Some(credential.into());
    }

    pub async fn has_credential(&self) -> bool {
        self.inner.state.read().await.credential.is_some()
    }

    /// Append a user message and start a turn answering it.
    ///
    /// Returns the ids of the user message and the streaming assistant
    /// placeholder.
    pub async fn send_message(&self, text: &str) -> Result<(String, String), SessionError> {
        let mut state = self.inner.state.write().await;
        if state.is_streaming {
            return Err(SessionError::TurnInFlight);
        }
        let Some(credential) = state.credential.clone() else {
            return Err(SessionError::MissingCredential);
        };
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let user = ChatMessage::user(text);
        let placeholder = ChatMessage::assistant_placeholder();
        let ids = (user.id.clone(), placeholder.id.clone());

        state.messages.push(user.clone());
        let history = conversation_history(&state.messages);
        state.messages.push(placeholder.clone());
        state.is_streaming = true;
        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        let generation = state.generation;
        drop(state);

        self.notify(SessionUpdate::MessageUpdated { message: user });
        self.notify(SessionUpdate::MessageUpdated {
            message: placeholder.clone(),
        });
        info!(message_id = %placeholder.id, "Turn started");

        let tables = self.tables().await;
        let session = self.clone();
        tokio::spawn(async move {
            session
                .run_turn(credential, history, tables, placeholder, cancel, generation)
                .await;
        });

        Ok(ids)
    }

    async fn run_turn(
        &self,
        credential: String,
        history: Vec<ConversationMessage>,
        tables: Vec<TableInfo>,
        placeholder: ChatMessage,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let message_id = placeholder.id.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let engine = async {
            // The sender lives only as long as the engine so the reducer sees
            // the channel close when the turn is cancelled.
            let tx = tx;
            self.inner
                .agent
                .run_turn(TurnContext {
                    credential: &credential,
                    history,
                    tables: &tables,
                    executor: self.inner.executor.as_ref(),
                    events: &tx,
                    cancel: &cancel,
                })
                .await
        };
        let sink = SessionSink {
            session: self.clone(),
            generation,
        };
        let reducer = drive_turn(
            TurnReducer::new(self.inner.flush_interval),
            placeholder,
            rx,
            &sink,
        );

        let (outcome, _) = tokio::join!(engine, reducer);
        info!(message_id = %message_id, outcome = ?outcome, "Turn finished");

        let mut state = self.inner.state.write().await;
        if state.generation != generation {
            debug!(message_id = %message_id, "Session cleared during turn");
            return;
        }
        state.is_streaming = false;
        state.cancel = None;
        drop(state);
        self.notify(SessionUpdate::TurnFinished { message_id });
    }

    /// Cancel the in-flight turn, keeping the transcript.
    pub async fn stop(&self) -> bool {
        let state = self.inner.state.read().await;
        match &state.cancel {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel any in-flight turn and reset the session.
    pub async fn clear(&self) {
        let mut state = self.inner.state.write().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.messages.clear();
        state.is_streaming = false;
        state.credential = None;
        state.generation += 1;
        drop(state);
        info!("Session cleared");
        self.notify(SessionUpdate::Cleared);
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.state.read().await.messages.clone()
    }

    pub async fn is_streaming(&self) -> bool {
        self.inner.state.read().await.is_streaming
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.updates.subscribe()
    }

    pub async fn tables(&self) -> Vec<TableInfo> {
        self.inner.tables.read().await.clone()
    }

    /// Reload the schema snapshot. Failures keep the previous snapshot.
    pub async fn refresh_tables(&self) {
        match self.inner.catalog.list_tables().await {
            Ok(tables) => {
                debug!(tables = tables.len(), "Schema refreshed");
                *self.inner.tables.write().await = tables;
            }
            Err(e) => warn!(error = %e, "Failed to refresh schema"),
        }
    }

    /// Run a statement directly, outside any turn.
    ///
    /// Returns the output with the time the statement took. The schema
    /// refresh that follows is not part of that time.
    pub async fn execute(&self, sql: &str) -> Result<(QueryOutput, Duration), QueryError> {
        let started = Instant::now();
        let result = self.inner.executor.execute(sql).await;
        let elapsed = started.elapsed();
        self.refresh_tables().await;
        result.map(|output| (output, elapsed))
    }

    fn notify(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.inner.updates.send(update);
    }
}

struct SessionSink {
    session: Session,
    generation: u64,
}

#[async_trait]
impl TurnSink for SessionSink {
    async fn publish(&self, message: &ChatMessage) -> bool {
        let mut state = self.session.inner.state.write().await;
        if state.generation != self.generation {
            return false;
        }
        let Some(slot) = state.messages.iter_mut().find(|m| m.id == message.id) else {
            return false;
        };
        *slot = message.clone();
        drop(state);
        self.session.notify(SessionUpdate::MessageUpdated {
            message: message.clone(),
        });
        true
    }

    fn refresh_schema(&self) {
        let session = self.session.clone();
        tokio::spawn(async move { session.refresh_tables().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::llm::{ScriptedClient, ScriptedRound};
    use crate::tools::SqliteDatabase;
    use crate::transcript::ContentSegment;
    use tokio_test::{assert_err, assert_ok};

    fn session_with(rounds: Vec<ScriptedRound>) -> (Session, Arc<ScriptedClient>) {
        let llm = Arc::new(ScriptedClient::new(rounds));
        let db = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let agent = Agent::new(llm.clone(), AgentConfig::default());
        let session = Session::new(agent, db.clone(), db, Duration::from_millis(50));
        (session, llm)
    }

    async fn wait_for_turn(rx: &mut broadcast::Receiver<SessionUpdate>) {
        loop {
            match rx.recv().await {
                Ok(SessionUpdate::TurnFinished { .. }) => return,
                Ok(_) => continue,
                Err(e) => panic!("update stream ended: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn rejects_without_credential_or_text() {
        let (session, _) = session_with(vec![]);
        assert_eq!(
            session.send_message("hi").await,
            Err(SessionError::MissingCredential)
        );

        session.set_credential("sk-test").await;
        assert_eq!(
            session.send_message("   ").await,
            Err(SessionError::EmptyMessage)
        );
        assert!(session.messages().await.is_empty());
    }

    #[tokio::test]
    async fn turn_streams_into_placeholder() {
        let (session, llm) = session_with(vec![ScriptedRound::answer(&["Hello", " there"])]);
        session.set_credential("sk-test").await;
        let mut rx = session.subscribe();

        let (user_id, assistant_id) = assert_ok!(session.send_message("hi").await);
        wait_for_turn(&mut rx).await;

        let messages = session.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, user_id);
        assert_eq!(messages[1].id, assistant_id);
        assert_eq!(messages[1].content, "Hello there");
        assert!(!messages[1].is_streaming);
        assert!(!session.is_streaming().await);
        assert_eq!(
            messages[1].segments,
            Some(vec![ContentSegment::Answer {
                text: "Hello there".to_string()
            }])
        );
        assert_eq!(llm.requests()[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_rejected() {
        let (session, _) = session_with(vec![ScriptedRound::answer(&["ok"])]);
        session.set_credential("sk-test").await;
        let mut rx = session.subscribe();

        assert_ok!(session.send_message("first").await);
        assert_err!(session.send_message("second").await);
        wait_for_turn(&mut rx).await;
        assert_eq!(session.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn clear_resets_everything() {
        let (session, _) = session_with(vec![ScriptedRound::answer(&["ok"])]);
        session.set_credential("sk-test").await;
        let mut rx = session.subscribe();
        assert_ok!(session.send_message("hello").await);
        wait_for_turn(&mut rx).await;

        session.clear().await;

        assert!(session.messages().await.is_empty());
        assert!(!session.is_streaming().await);
        assert!(!session.has_credential().await);
        assert_eq!(
            session.send_message("again").await,
            Err(SessionError::MissingCredential)
        );
    }

    #[tokio::test]
    async fn direct_queries_refresh_tables() {
        let (session, _) = session_with(vec![]);
        assert!(session.tables().await.is_empty());

        assert_ok!(session.execute("CREATE TABLE orders (id INTEGER)").await);
        let tables = session.tables().await;
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "orders");

        let err = session.execute("SELECT * FROM ordrs").await.unwrap_err();
        assert!(err.message.contains("ordrs"));
    }

    struct InstantExecutor;

    #[async_trait]
    impl SqlExecutor for InstantExecutor {
        async fn execute(&self, _sql: &str) -> Result<QueryOutput, QueryError> {
            Ok(QueryOutput::default())
        }
    }

    struct SlowCatalog;

    #[async_trait]
    impl SchemaCatalog for SlowCatalog {
        async fn list_tables(&self) -> anyhow::Result<Vec<TableInfo>> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn query_time_excludes_schema_refresh() {
        let agent = Agent::new(Arc::new(ScriptedClient::new(vec![])), AgentConfig::default());
        let session = Session::new(
            agent,
            Arc::new(InstantExecutor),
            Arc::new(SlowCatalog),
            Duration::from_millis(50),
        );

        let started = Instant::now();
        let (_, elapsed) = assert_ok!(session.execute("SELECT 1").await);

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn updates_serialize_with_type_tag() {
        let update = SessionUpdate::TurnFinished {
            message_id: "abc".to_string(),
        };
        assert_eq!(update.event_name(), "turn_finished");
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({"type": "turnFinished", "messageId": "abc"})
        );
    }
}
