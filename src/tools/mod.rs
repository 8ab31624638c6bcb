//! The `execute_sql` tool and the database capabilities it runs against.

mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::llm::ToolDescriptor;

pub use sqlite::SqliteDatabase;

/// Name under which the SQL tool is exposed to the model.
pub const EXECUTE_SQL: &str = "execute_sql";

/// One result row keyed by column name.
pub type Row = Map<String, Value>;

/// Declaration of the `execute_sql` tool sent with every request.
pub fn execute_sql_tool() -> ToolDescriptor {
    ToolDescriptor {
        name: EXECUTE_SQL.to_string(),
        description: "Execute a SQL query against the playground's embedded database. Use this to \
                      query loaded tables, create views, or run any valid SQL. Results are returned \
                      as JSON rows."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "The SQL query to execute"
                }
            },
            "required": ["sql"]
        }),
    }
}

/// Columns and rows produced by a statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
}

/// A statement failed to execute.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A column of a loaded table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// Schema snapshot of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: u64,
}

/// Runs SQL text. Must stay usable after a failed statement.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryOutput, QueryError>;
}

/// Lists the tables currently loaded.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn list_tables(&self) -> anyhow::Result<Vec<TableInfo>>;
}
