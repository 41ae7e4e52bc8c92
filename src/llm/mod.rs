//! The LLM-session façade.
//!
//! The system consumes a single capability from the external tool-calling
//! runtime: create a session, advance it one prompt at a time, and read
//! back the last assistant text. Anything satisfying [`LlmSession`] is
//! acceptable; implementations persist their own conversation history
//! under the session directory they are given.

pub mod provider;
pub mod scripted;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::provider_key_env_var;
use crate::error::LlmError;
use crate::tools::Tool;

pub use provider::ChatRuntime;
pub use scripted::{ScriptedRuntime, ScriptedSession};

/// Context-window usage reported by a session, for pre-compaction hints.
#[derive(Debug, Clone, Copy)]
pub struct ContextUsage {
    /// Fraction of the context window in use, in `[0, 1]`.
    pub percent: f64,
}

/// One live LLM conversation.
#[async_trait]
pub trait LlmSession: Send + Sync {
    /// Advance the conversation by one turn, executing tool calls opaquely.
    async fn prompt(&self, text: &str) -> Result<(), LlmError>;

    /// The assistant text produced by the most recent turn, if any.
    async fn last_assistant_text(&self) -> Option<String>;

    /// Current context usage, when the implementation can estimate it.
    async fn context_usage(&self) -> Option<ContextUsage> {
        None
    }

    /// Release any resources held by the session.
    async fn close(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Factory for LLM sessions.
#[async_trait]
pub trait LlmRuntime: Send + Sync {
    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<Arc<dyn LlmSession>, LlmError>;
}

/// In-memory mapping of provider name to API key.
///
/// Keys never leave this store: they are not logged, not written to disk,
/// and not passed on command lines.
#[derive(Clone, Default)]
pub struct AuthStore {
    keys: HashMap<String, SecretString>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a key for a provider.
    pub fn insert(&mut self, provider: impl Into<String>, key: SecretString) {
        self.keys.insert(provider.into(), key);
    }

    /// The key for a provider, if present.
    pub fn get(&self, provider: &str) -> Option<&SecretString> {
        self.keys.get(provider)
    }

    /// Consume the provider's environment variable into the store, then
    /// delete it from the process environment.
    pub fn consume_env(&mut self, provider: &str) -> bool {
        let var = provider_key_env_var(provider);
        match std::env::var(&var) {
            Ok(value) if !value.trim().is_empty() => {
                self.keys
                    .insert(provider.to_string(), SecretString::from(value));
                std::env::remove_var(&var);
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore")
            .field("providers", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Configuration for creating one session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Model identifier, opaque to the supervisor.
    pub model: String,
    /// Names of runtime-provided tools to expose.
    pub tools: Vec<String>,
    /// Locally dispatched tools (memory, cron, subagents).
    pub custom_tools: Vec<Arc<dyn Tool>>,
    /// Directory the session may freely read and write.
    pub workspace_path: PathBuf,
    /// Directory where the runtime persists conversation history.
    pub session_dir: PathBuf,
    /// Provider keys.
    pub auth: AuthStore,
    /// Whether tool dispatch runs on behalf of a subagent.
    pub is_subagent: bool,
    /// Resume prior history from `session_dir` when present.
    pub resume: bool,
}

impl SessionOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            tools: Vec::new(),
            custom_tools: Vec::new(),
            workspace_path: PathBuf::from("."),
            session_dir: PathBuf::from("."),
            auth: AuthStore::new(),
            is_subagent: false,
            resume: true,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_custom_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.custom_tools = tools;
        self
    }

    pub fn with_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_path = path.into();
        self
    }

    pub fn with_session_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_dir = path.into();
        self
    }

    pub fn with_auth(mut self, auth: AuthStore) -> Self {
        self.auth = auth;
        self
    }

    pub fn for_subagent(mut self) -> Self {
        self.is_subagent = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_store_debug_hides_keys() {
        let mut store = AuthStore::new();
        store.insert("openai", SecretString::from("sk-secret".to_string()));
        let rendered = format!("{:?}", store);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("openai"));
    }

    #[test]
    fn test_consume_env_removes_variable() {
        std::env::set_var("TESTPROV_API_KEY", "k-123");
        let mut store = AuthStore::new();
        assert!(store.consume_env("testprov"));
        assert!(store.get("testprov").is_some());
        assert!(std::env::var("TESTPROV_API_KEY").is_err());
    }
}
