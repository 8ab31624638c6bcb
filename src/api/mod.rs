//! HTTP API.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `PUT /api/credential` - Set the session API key
//! - `GET /api/messages` - Transcript and streaming flag
//! - `POST /api/messages` - Send a message and start a turn
//! - `DELETE /api/messages` - Clear the session
//! - `POST /api/stop` - Cancel the running turn
//! - `GET /api/events` - Stream session updates (SSE)
//! - `GET /api/tables` - Loaded tables
//! - `POST /api/query` - Run SQL directly

mod routes;
mod types;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::Agent;
use crate::config::Config;
use crate::llm::{AnthropicClient, LlmClient};
use crate::session::Session;
use crate::tools::SqliteDatabase;

pub use routes::AppState;
pub use types::*;

/// Build the router around an existing session.
pub fn app(session: Session) -> Router {
    routes::routes()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(AppState { session }))
}

/// Build a session from `config`.
pub async fn build_session(config: &Config) -> anyhow::Result<Session> {
    let db = match &config.database_path {
        Some(path) => SqliteDatabase::open(path)
            .with_context(|| format!("opening database {}", path.display()))?,
        None => SqliteDatabase::open_in_memory()?,
    };
    let db = Arc::new(db);
    let llm: Arc<dyn LlmClient> = Arc::new(AnthropicClient::new(config.base_url.clone()));
    let agent = Agent::new(llm, config.agent.clone());

    let session = Session::new(agent, db.clone(), db, config.flush_interval);
    if let Some(key) = &config.api_key {
        session.set_credential(key.clone()).await;
    }
    session.refresh_tables().await;
    Ok(session)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let session = build_session(&config).await?;
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app(session)).await?;
    Ok(())
}
