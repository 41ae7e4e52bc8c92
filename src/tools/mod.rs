//! Agent tools: descriptors, the subagent denied set, and dispatch.
//!
//! Tools here are the agent-owned capabilities (memory, scheduling,
//! subagents) handed to the LLM runtime as "custom tools". The runtime
//! treats them opaquely and calls back into [`dispatch`] when the model
//! invokes one. Denied operations are returned as tool-result error
//! objects, never raised.

pub mod builtin;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Tool names a subagent must never see.
pub const SUBAGENT_DENIED_TOOLS: &[&str] = &[
    "spawn_subagent",
    "stop_subagent",
    "list_subagents",
    "remember",
    "recall",
    "cron_schedule",
    "cron_list",
    "cron_cancel",
];

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Operation denied to the caller. The payload is a stable error code
    /// (e.g. `nested_spawn_blocked`) surfaced in the tool result.
    #[error("Denied: {0}")]
    Denied(&'static str),
}

/// Caller context threaded through every tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Set when the invoking session belongs to a subagent. Subagent
    /// tools short-circuit into an error result when this is set.
    pub is_subagent: bool,
    /// Session id of the invoking conversation, for session-scoped memory.
    pub session_id: Option<String>,
}

impl ToolContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            is_subagent: false,
            session_id: Some(session_id.into()),
        }
    }

    pub fn for_subagent() -> Self {
        Self {
            is_subagent: true,
            session_id: None,
        }
    }
}

/// Trait for tools the agent can use.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// The main agent's tool list minus the denied set.
pub fn filter_for_subagent(tools: &[Arc<dyn Tool>]) -> Vec<Arc<dyn Tool>> {
    tools
        .iter()
        .filter(|tool| !SUBAGENT_DENIED_TOOLS.contains(&tool.name()))
        .cloned()
        .collect()
}

/// Invoke a tool by name, encoding failures as tool-result error objects.
///
/// An unknown name, bad parameters, or a denied operation all come back as
/// `{"error": ...}` values so the model sees a structured result rather
/// than the turn failing.
pub async fn dispatch(
    tools: &[Arc<dyn Tool>],
    name: &str,
    params: serde_json::Value,
    ctx: &ToolContext,
) -> serde_json::Value {
    let Some(tool) = tools.iter().find(|t| t.name() == name) else {
        return serde_json::json!({ "error": format!("unknown tool: {}", name) });
    };

    match tool.execute(params, ctx).await {
        Ok(result) => result,
        Err(ToolError::Denied(code)) => serde_json::json!({ "error": code }),
        Err(err) => serde_json::json!({ "error": err.to_string() }),
    }
}
