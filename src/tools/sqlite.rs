//! Embedded SQLite database backing the playground.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use rusqlite::types::ValueRef;
use rusqlite::{params, Batch, Connection, Statement};
use serde_json::{json, Value};

use super::{ColumnInfo, QueryError, QueryOutput, Row, SchemaCatalog, SqlExecutor, TableInfo};

/// A single SQLite connection shared between the agent and ad-hoc queries.
///
/// Statements run on the blocking pool; the connection mutex serializes them.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| QueryError::new("database connection lock poisoned"))?;
            f(&guard).map_err(|e| QueryError::new(e.to_string()))
        })
        .await
        .map_err(|e| QueryError::new(format!("query task failed: {}", e)))?
    }
}

#[async_trait]
impl SqlExecutor for SqliteDatabase {
    async fn execute(&self, sql: &str) -> Result<QueryOutput, QueryError> {
        let sql = sql.to_string();
        self.with_conn(move |conn| run_statements(conn, &sql)).await
    }
}

#[async_trait]
impl SchemaCatalog for SqliteDatabase {
    async fn list_tables(&self) -> anyhow::Result<Vec<TableInfo>> {
        Ok(self.with_conn(load_tables).await?)
    }
}

/// Run every statement in `sql` in order and return the last one's result.
///
/// A failing statement stops the batch; statements before it stay applied.
fn run_statements(conn: &Connection, sql: &str) -> Result<QueryOutput, rusqlite::Error> {
    let mut batch = Batch::new(conn, sql);
    let mut last = QueryOutput::default();
    while let Some(mut stmt) = batch.next()? {
        last = run_statement(&mut stmt)?;
    }
    Ok(last)
}

fn run_statement(stmt: &mut Statement<'_>) -> Result<QueryOutput, rusqlite::Error> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    if columns.is_empty() {
        let changes = stmt.execute([])?;
        let mut row = Row::new();
        row.insert("changes".to_string(), json!(changes));
        return Ok(QueryOutput {
            columns: vec!["changes".to_string()],
            rows: vec![row],
            row_count: 1,
        });
    }

    let mut out = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(idx)?));
        }
        out.push(record);
    }

    Ok(QueryOutput {
        row_count: out.len(),
        columns,
        rows: out,
    })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

fn load_tables(conn: &Connection) -> Result<Vec<TableInfo>, rusqlite::Error> {
    let names: Vec<String> = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let columns = conn
            .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?
            .query_map(params![name], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    column_type: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let row_count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", name.replace('"', "\"\"")),
            [],
            |row| row.get(0),
        )?;

        tables.push(TableInfo {
            name,
            columns,
            row_count: row_count.max(0) as u64,
        });
    }
    Ok(tables)
}
