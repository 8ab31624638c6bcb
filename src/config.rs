//! Configuration management for the SQL playground.
//!
//! Configuration can be set via environment variables:
//! - `ANTHROPIC_API_KEY` - Optional. Initial credential for the agent session.
//! - `ANTHROPIC_BASE_URL` - Optional. Model provider endpoint. Defaults to `https://api.anthropic.com`.
//! - `MODEL` - Optional. The model identifier. Defaults to `claude-sonnet-4-20250514`.
//! - `MAX_TOKENS` - Optional. Token budget per request. Defaults to `4096`.
//! - `MAX_ROUNDS` - Optional. Maximum request/response rounds per turn. Defaults to `25`.
//! - `MAX_RESULT_ROWS` - Optional. Rows returned to the model per query. Defaults to `100`.
//! - `FLUSH_INTERVAL_MS` - Optional. Debounce interval for streamed text. Defaults to `50`.
//! - `DATABASE_PATH` - Optional. SQLite database file. In-memory when unset.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Agent loop limits and model selection.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model identifier sent with every request
    pub model: String,

    /// Token budget per request
    pub max_tokens: u32,

    /// Maximum request/response rounds within one turn
    pub max_rounds: usize,

    /// Rows of a query result returned to the model and the transcript
    pub max_result_rows: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            max_rounds: 25,
            max_result_rows: 100,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Credential the session starts with, if any
    pub api_key: Option<String>,

    /// Base URL of the model provider
    pub base_url: String,

    /// Agent loop settings
    pub agent: AgentConfig,

    /// Debounce interval applied to streamed text
    pub flush_interval: Duration,

    /// SQLite database file (in-memory when `None`)
    pub database_path: Option<PathBuf>,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());

        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let agent = AgentConfig {
            model: std::env::var("MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            max_tokens: parse_env("MAX_TOKENS", 4096)?,
            max_rounds: parse_env("MAX_ROUNDS", 25)?,
            max_result_rows: parse_env("MAX_RESULT_ROWS", 100)?,
        };

        if agent.max_rounds == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_ROUNDS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let flush_interval = Duration::from_millis(parse_env("FLUSH_INTERVAL_MS", 50)?);

        let database_path = std::env::var("DATABASE_PATH").ok().map(PathBuf::from);

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env("PORT", 3000)?;

        Ok(Self {
            api_key,
            base_url,
            agent,
            flush_interval,
            database_path,
            host,
            port,
        })
    }

    /// Create a config with default values (useful for testing).
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            agent: AgentConfig::default(),
            flush_interval: Duration::from_millis(50),
            database_path: None,
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
