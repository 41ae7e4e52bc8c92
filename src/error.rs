//! Error types for the crate.
//!
//! Internal components raise typed failures; the boundaries (HTTP handlers,
//! the CLI) translate them into responses and exit codes.

use thiserror::Error;

/// Errors from the LLM runtime façade.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("No API key available for provider '{provider}'")]
    MissingApiKey { provider: String },

    #[error("Provider '{provider}' request failed: {message}")]
    Request { provider: String, message: String },

    #[error("Provider '{provider}' returned an unusable response: {message}")]
    BadResponse { provider: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session key: {0}")]
    InvalidKey(String),

    #[error("Session manager is closed")]
    Closed,

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from the memory store.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Memory entry not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to encode memory entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from the cron service.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("Cron job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Cron service is not running")]
    NotRunning,

    #[error("Cron store error: {0}")]
    Store(String),

    #[error("Job execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the subagent manager.
#[derive(Debug, Error)]
pub enum SubagentError {
    #[error("Subagent not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from the supervisor backend.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Failed to spawn agent '{id}': {reason}")]
    SpawnFailed { id: String, reason: String },

    #[error("Agent '{id}' did not become ready in time")]
    NotReady { id: String },

    #[error("Agent '{id}' request failed: {message}")]
    Request { id: String, message: String },

    #[error("Corrupt agent metadata at {path}: {message}")]
    BadMeta { path: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the per-agent server bootstrap.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("No API key on stdin and {env_var} is not set")]
    MissingApiKey { env_var: String },

    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
