//! Agent module - the SQL analyst agent loop.
//!
//! The agent follows a "tools in a loop" pattern:
//! 1. Build context with the schema-aware system prompt and conversation history
//! 2. Stream a model response, forwarding text as it arrives
//! 3. If the model requests `execute_sql`, run the queries and feed results back
//! 4. Repeat until the model answers, fails, is cancelled, or hits the round limit

mod agent_loop;
mod events;
mod prompt;

pub use agent_loop::{Agent, TurnContext, TurnOutcome};
pub use events::{AgentEvent, ToolCallResult};
pub use prompt::build_system_prompt;
