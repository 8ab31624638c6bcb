//! System prompt for the analyst agent.

use std::fmt::Write;

use crate::tools::TableInfo;

const GUIDELINES: &str = r#"You are a helpful data analyst assistant working with an embedded SQLite database.
You can execute SQL queries using the execute_sql tool to answer questions about the user's data.

Guidelines:
- Write clear, efficient SQLite queries
- When exploring data, start with small queries (use LIMIT)
- Explain your findings in plain language after getting results
- If a query fails, read the error, fix the query and retry
- Use double quotes for table and column names that might conflict with reserved words
"#;

/// Build the system prompt from the current schema snapshot.
pub fn build_system_prompt(tables: &[TableInfo]) -> String {
    let mut prompt = String::from(GUIDELINES);

    if tables.is_empty() {
        prompt.push_str("\nNo tables are currently loaded. Ask the user to load some data first.");
        return prompt;
    }

    prompt.push_str("\nCurrently loaded tables:\n");
    for table in tables {
        let _ = write!(
            prompt,
            "\nTable: \"{}\" ({} rows)\nColumns:\n",
            table.name, table.row_count
        );
        for column in &table.columns {
            let _ = writeln!(prompt, "  - \"{}\" ({})", column.name, column.column_type);
        }
    }

    prompt
}
