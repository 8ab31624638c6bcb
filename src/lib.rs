//! # SQL Playground
//!
//! A conversational SQL analyst over a local SQLite database.
//!
//! This library provides:
//! - An agent loop that lets the model run `execute_sql` until it can answer
//! - A transcript reducer that turns agent events into segmented chat messages
//! - A session holder with a single in-flight turn and cooperative cancellation
//! - An HTTP API exposing the session, the schema and direct queries
//!
//! ## Architecture
//!
//! The agent follows the "tools in a loop" pattern:
//! 1. Build context with a schema-aware system prompt and the chat history
//! 2. Stream a model response, forwarding text as it arrives
//! 3. Execute any requested queries and feed the results back
//! 4. Repeat until the model answers
//!
//! ## Example
//!
//! ```rust,ignore
//! use sql_playground::{api, config::Config};
//!
//! let config = Config::from_env()?;
//! let session = api::build_session(&config).await?;
//! session.set_credential("sk-ant-...").await;
//! let (_, assistant_id) = session.send_message("how many rows in orders?").await?;
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod llm;
pub mod session;
pub mod tools;
pub mod transcript;

pub use config::Config;
