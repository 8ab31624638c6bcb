//! HTTP handlers for the playground API.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post, put},
    Json, Router,
};
use futures::Stream;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::types::*;
use crate::session::{Session, SessionError};
use crate::tools::TableInfo;

/// Shared application state.
pub struct AppState {
    pub session: Session,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/credential", put(set_credential))
        .route(
            "/api/messages",
            get(list_messages).post(send_message).delete(clear_messages),
        )
        .route("/api/stop", post(stop))
        .route("/api/events", get(stream_events))
        .route("/api/tables", get(list_tables))
        .route("/api/query", post(run_query))
}

fn session_error(err: SessionError) -> (StatusCode, String) {
    let status = match err {
        SessionError::TurnInFlight => StatusCode::CONFLICT,
        SessionError::MissingCredential | SessionError::EmptyMessage => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn set_credential(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialRequest>,
) -> ApiResult<StatusCode> {
    let key = req.api_key.trim();
    if key.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "API key is empty".to_string()));
    }
    state.session.set_credential(key).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(State(state): State<Arc<AppState>>) -> Json<MessagesResponse> {
    Json(MessagesResponse {
        messages: state.session.messages().await,
        is_streaming: state.session.is_streaming().await,
    })
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<SendMessageResponse>)> {
    let (user_message_id, assistant_message_id) = state
        .session
        .send_message(&req.text)
        .await
        .map_err(session_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SendMessageResponse {
            user_message_id,
            assistant_message_id,
        }),
    ))
}

async fn clear_messages(State(state): State<Arc<AppState>>) -> StatusCode {
    state.session.clear().await;
    StatusCode::NO_CONTENT
}

async fn stop(State(state): State<Arc<AppState>>) -> Json<StopResponse> {
    Json(StopResponse {
        stopped: state.session.stop().await,
    })
}

async fn list_tables(State(state): State<Arc<AppState>>) -> Json<Vec<TableInfo>> {
    Json(state.session.tables().await)
}

async fn run_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<QueryResult>> {
    let (output, elapsed) = state
        .session
        .execute(&req.sql)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.message))?;
    Ok(Json(QueryResult {
        result_type: ResultType::for_sql(&req.sql),
        columns: output.columns,
        rows: output.rows,
        row_count: output.row_count,
        execution_time_ms: elapsed.as_millis() as u64,
    }))
}

/// Stream session updates via SSE.
async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.session.subscribe();
    let stream_id = Uuid::new_v4();
    tracing::info!(stream_id = %stream_id, "Event stream opened");

    struct StreamDropGuard(Uuid);

    impl Drop for StreamDropGuard {
        fn drop(&mut self) {
            tracing::info!(stream_id = %self.0, "Event stream closed");
        }
    }

    let drop_guard = StreamDropGuard(stream_id);

    let stream = async_stream::stream! {
        let _guard = drop_guard;
        loop {
            match rx.recv().await {
                Ok(update) => {
                    tracing::trace!(stream_id = %stream_id, event = update.event_name(), "Session event");
                    match Event::default().event(update.event_name()).json_data(&update) {
                        Ok(sse) => yield Ok(sse),
                        Err(e) => {
                            tracing::error!(
                                stream_id = %stream_id,
                                error = %e,
                                "Failed to serialize SSE event; dropping"
                            );
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Clients resync through GET /api/messages.
                    tracing::warn!(stream_id = %stream_id, skipped, "Event stream lagged");
                    yield Ok(Event::default().event("lagged").data(skipped.to_string()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
