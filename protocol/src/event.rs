use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::surface::ChatResponse;

/// A single step of the agent loop's progress, as seen by a streaming
/// consumer. Event order reflects real-time progression: a `ToolCall` for
/// call id X precedes `ToolResult` for X, which precedes any subsequent
/// `ToolCall`; exactly one `Result` precedes exactly one `Done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A fragment of planner text, as it streams in.
    Token { text: String },

    ToolCall { call_id: String, name: String, input: Value },

    ToolResult { call_id: String, name: String, output: String },

    /// The final chat response for this turn. Occurs exactly once,
    /// immediately before `Done`.
    Result { response: Box<ChatResponse> },

    Done,

    Error { message: String },
}
