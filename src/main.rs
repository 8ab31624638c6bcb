//! SQL Playground - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the playground session.

use sql_playground::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sql_playground=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, database={}",
        config.agent.model,
        config
            .database_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    );
    if config.api_key.is_none() {
        info!("No ANTHROPIC_API_KEY set; waiting for PUT /api/credential");
    }

    api::serve(config).await?;

    Ok(())
}
