//! A deterministic in-memory façade implementation for tests.
//!
//! Sessions created by [`ScriptedRuntime`] pop replies from a shared
//! script, or echo the prompt when the script runs dry. Prompts, closes
//! and created sessions are all observable, which is what the session
//! manager, subagent and orchestrator tests drive against.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::{ContextUsage, LlmRuntime, LlmSession, SessionOptions};

#[derive(Default)]
struct ScriptInner {
    replies: Mutex<VecDeque<String>>,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
    fail_next_create: AtomicBool,
    create_delay: Mutex<Option<std::time::Duration>>,
}

/// Scripted runtime: every created session shares the reply script.
#[derive(Clone, Default)]
pub struct ScriptedRuntime {
    inner: Arc<ScriptInner>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply; sessions consume replies in FIFO order.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.inner
            .replies
            .lock()
            .expect("script lock poisoned")
            .push_back(reply.into());
    }

    /// Sessions created so far, in creation order.
    pub fn sessions(&self) -> Vec<Arc<ScriptedSession>> {
        self.inner
            .sessions
            .lock()
            .expect("script lock poisoned")
            .clone()
    }

    /// Number of sessions created so far.
    pub fn created_sessions(&self) -> usize {
        self.inner.sessions.lock().expect("script lock poisoned").len()
    }

    /// Make the next `create_session` call fail.
    pub fn fail_next_create(&self) {
        self.inner.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Delay every `create_session` call, to widen single-flight races.
    pub fn set_create_delay(&self, delay: std::time::Duration) {
        *self
            .inner
            .create_delay
            .lock()
            .expect("script lock poisoned") = Some(delay);
    }
}

#[async_trait]
impl LlmRuntime for ScriptedRuntime {
    async fn create_session(
        &self,
        _options: SessionOptions,
    ) -> Result<Arc<dyn LlmSession>, LlmError> {
        let delay = *self
            .inner
            .create_delay
            .lock()
            .expect("script lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(LlmError::Request {
                provider: "scripted".to_string(),
                message: "scripted create failure".to_string(),
            });
        }
        let session = Arc::new(ScriptedSession {
            script: Arc::clone(&self.inner),
            prompts: Mutex::new(Vec::new()),
            last_text: Mutex::new(None),
            usage: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.inner
            .sessions
            .lock()
            .expect("script lock poisoned")
            .push(Arc::clone(&session));
        Ok(session)
    }
}

/// A session whose replies come from the runtime's script.
pub struct ScriptedSession {
    script: Arc<ScriptInner>,
    prompts: Mutex<Vec<String>>,
    last_text: Mutex<Option<String>>,
    usage: Mutex<Option<f64>>,
    closed: AtomicBool,
}

impl ScriptedSession {
    /// Every prompt this session has seen, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("session lock poisoned").clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Inject a context-usage value for pre-compaction tests.
    pub fn set_usage(&self, percent: f64) {
        *self.usage.lock().expect("session lock poisoned") = Some(percent);
    }
}

#[async_trait]
impl LlmSession for ScriptedSession {
    async fn prompt(&self, text: &str) -> Result<(), LlmError> {
        self.prompts
            .lock()
            .expect("session lock poisoned")
            .push(text.to_string());
        let reply = self
            .script
            .replies
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| format!("echo: {}", text));
        *self.last_text.lock().expect("session lock poisoned") = Some(reply);
        Ok(())
    }

    async fn last_assistant_text(&self) -> Option<String> {
        self.last_text.lock().expect("session lock poisoned").clone()
    }

    async fn context_usage(&self) -> Option<ContextUsage> {
        self.usage
            .lock()
            .expect("session lock poisoned")
            .map(|percent| ContextUsage { percent })
    }

    async fn close(&self) -> Result<(), LlmError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
