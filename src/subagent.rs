//! Background subagents.
//!
//! A subagent is a transient task that runs a single prompt in a fresh,
//! isolated LLM session and announces its result back to the requester's
//! channel. Subagents never share sessions with the main agent, never
//! spawn subagents of their own, and see a reduced tool set (the main
//! agent's tools minus scheduling, memory and subagent tools).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::oneshot;

use crate::bus::{MessageBus, OutboundMessage};
use crate::error::SubagentError;
use crate::llm::{LlmRuntime, SessionOptions};
use crate::session::key::sanitize_id;
use crate::tools::{filter_for_subagent, Tool};

/// Default retention for finished subagent records.
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(30 * 60);

/// Lifecycle state of a subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
}

impl SubagentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A subagent record, as reported by `list` and `get`.
#[derive(Debug, Clone)]
pub struct SubagentRecord {
    pub id: String,
    pub task: String,
    pub label: Option<String>,
    pub status: SubagentStatus,
    /// Synthetic session key, distinct from all supervisor-level keys.
    pub session_key: String,
    pub requester_channel: String,
    pub requester_chat_id: String,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub runtime_ms: Option<i64>,
}

/// Spawn parameters.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub task: String,
    pub label: Option<String>,
    /// Overrides the current routing context when set.
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    /// Cancel the run after this many seconds; `0` or absent disables.
    pub timeout_seconds: Option<u64>,
}

impl SpawnRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

struct Entry {
    record: SubagentRecord,
    cancel: Option<oneshot::Sender<()>>,
}

struct Inner {
    parent_id: String,
    runtime: Arc<dyn LlmRuntime>,
    options_template: SessionOptions,
    bus: Arc<MessageBus>,
    records: Mutex<HashMap<String, Entry>>,
    /// `(channel, chat_id)` of the message currently being dispatched;
    /// spawned subagents announce back there.
    routing: Mutex<(String, String)>,
    /// The main agent's tool list; filtered per spawn.
    tools: Mutex<Vec<Arc<dyn Tool>>>,
}

/// Fire-and-forget pool of background subagent tasks.
pub struct SubagentManager {
    inner: Arc<Inner>,
}

impl SubagentManager {
    pub fn new(
        parent_id: impl Into<String>,
        runtime: Arc<dyn LlmRuntime>,
        options_template: SessionOptions,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                parent_id: sanitize_id(&parent_id.into()),
                runtime,
                options_template,
                bus,
                records: Mutex::new(HashMap::new()),
                routing: Mutex::new(("cli".to_string(), "local".to_string())),
                tools: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Install the main agent's tool list. Subagents get this list minus
    /// the denied set.
    pub fn set_available_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        *self.inner.tools.lock().expect("tools lock poisoned") = tools;
    }

    /// Update the routing context before dispatching an inbound message.
    pub fn set_routing_context(&self, channel: impl Into<String>, chat_id: impl Into<String>) {
        *self.inner.routing.lock().expect("routing lock poisoned") =
            (channel.into(), chat_id.into());
    }

    /// Start a subagent and return its id immediately; the work proceeds
    /// in the background.
    pub fn spawn(&self, request: SpawnRequest) -> String {
        let id = short_id();
        let (default_channel, default_chat) = self
            .inner
            .routing
            .lock()
            .expect("routing lock poisoned")
            .clone();
        let channel = request.channel.clone().unwrap_or(default_channel);
        let chat_id = request.chat_id.clone().unwrap_or(default_chat);

        let record = SubagentRecord {
            id: id.clone(),
            task: request.task.clone(),
            label: request.label.clone(),
            status: SubagentStatus::Running,
            session_key: format!("subagent:{}:{}", self.inner.parent_id, id),
            requester_channel: channel,
            requester_chat_id: chat_id,
            created_at_ms: Utc::now().timestamp_millis(),
            completed_at_ms: None,
            result: None,
            error: None,
            runtime_ms: None,
        };

        let timeout = request
            .timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        self.inner
            .records
            .lock()
            .expect("records lock poisoned")
            .insert(
                id.clone(),
                Entry {
                    record,
                    cancel: Some(cancel_tx),
                },
            );

        let inner = Arc::clone(&self.inner);
        let worker_id = id.clone();
        tokio::spawn(async move {
            run_worker(inner, worker_id, timeout, cancel_rx).await;
        });

        tracing::info!(subagent = %id, "Spawned subagent");
        id
    }

    /// Stop a running subagent. Returns whether anything was stopped.
    pub fn stop(&self, id: &str) -> bool {
        let stopped_record = {
            let mut records = self.inner.records.lock().expect("records lock poisoned");
            let Some(entry) = records.get_mut(id) else {
                return false;
            };
            if entry.record.status != SubagentStatus::Running {
                return false;
            }
            if let Some(cancel) = entry.cancel.take() {
                let _ = cancel.send(());
            }
            let now = Utc::now().timestamp_millis();
            entry.record.status = SubagentStatus::Completed;
            entry.record.result = Some("Stopped by request".to_string());
            entry.record.completed_at_ms = Some(now);
            entry.record.runtime_ms = Some(now - entry.record.created_at_ms);
            entry.record.clone()
        };

        announce(
            &self.inner.bus,
            &stopped_record,
            format!(
                "[Subagent {}{} stopped]\n\nStopped by request.\n\n{}",
                stopped_record.id,
                label_suffix(&stopped_record),
                stats_line(&stopped_record)
            ),
        );
        true
    }

    /// Records, optionally filtered by status, newest first.
    pub fn list(&self, status: Option<SubagentStatus>) -> Vec<SubagentRecord> {
        let records = self.inner.records.lock().expect("records lock poisoned");
        let mut out: Vec<SubagentRecord> = records
            .values()
            .map(|entry| entry.record.clone())
            .filter(|record| status.map_or(true, |s| record.status == s))
            .collect();
        out.sort_by_key(|record| std::cmp::Reverse(record.created_at_ms));
        out
    }

    /// A single record by id.
    pub fn get(&self, id: &str) -> Option<SubagentRecord> {
        self.inner
            .records
            .lock()
            .expect("records lock poisoned")
            .get(id)
            .map(|entry| entry.record.clone())
    }

    /// Drop finished records older than `max_age`. Returns how many were
    /// removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let mut records = self.inner.records.lock().expect("records lock poisoned");
        let before = records.len();
        records.retain(|_, entry| {
            entry.record.status == SubagentStatus::Running
                || entry.record.created_at_ms >= cutoff
        });
        before - records.len()
    }
}

fn short_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn label_suffix(record: &SubagentRecord) -> String {
    record
        .label
        .as_deref()
        .map(|label| format!(" ({})", label))
        .unwrap_or_default()
}

fn stats_line(record: &SubagentRecord) -> String {
    let secs = record.runtime_ms.unwrap_or(0) as f64 / 1000.0;
    format!("Runtime: {:.1}s", secs)
}

fn announce(bus: &MessageBus, record: &SubagentRecord, content: String) {
    bus.publish_outbound(&OutboundMessage::new(
        record.requester_channel.clone(),
        record.requester_chat_id.clone(),
        content,
    ));
}

enum WorkerOutcome {
    Done(Result<String, SubagentError>),
    TimedOut,
    Cancelled,
}

async fn run_worker(
    inner: Arc<Inner>,
    id: String,
    timeout: Option<Duration>,
    cancel_rx: oneshot::Receiver<()>,
) {
    let work = execute_task(&inner, &id);
    tokio::pin!(work);

    let outcome = match timeout {
        Some(limit) => tokio::select! {
            result = &mut work => WorkerOutcome::Done(result),
            _ = tokio::time::sleep(limit) => WorkerOutcome::TimedOut,
            _ = cancel_rx => WorkerOutcome::Cancelled,
        },
        None => tokio::select! {
            result = &mut work => WorkerOutcome::Done(result),
            _ = cancel_rx => WorkerOutcome::Cancelled,
        },
    };

    match outcome {
        // `stop` already wrote the record and announced.
        WorkerOutcome::Cancelled => {}
        WorkerOutcome::TimedOut => {
            if let Some(record) = finish(&inner, &id, Err("Timeout exceeded".to_string())) {
                announce(
                    &inner.bus,
                    &record,
                    format!(
                        "[Subagent {}{} failed]\n\nTimeout exceeded.\n\n{}",
                        record.id,
                        label_suffix(&record),
                        stats_line(&record)
                    ),
                );
            }
        }
        WorkerOutcome::Done(Ok(text)) => {
            if let Some(record) = finish(&inner, &id, Ok(text.clone())) {
                announce(
                    &inner.bus,
                    &record,
                    format!(
                        "[Subagent {}{} completed successfully]\n\n{}\n\n{}",
                        record.id,
                        label_suffix(&record),
                        text,
                        stats_line(&record)
                    ),
                );
            }
        }
        WorkerOutcome::Done(Err(e)) => {
            if let Some(record) = finish(&inner, &id, Err(e.to_string())) {
                announce(
                    &inner.bus,
                    &record,
                    format!(
                        "[Subagent {}{} failed]\n\n{}\n\n{}",
                        record.id,
                        label_suffix(&record),
                        e,
                        stats_line(&record)
                    ),
                );
            }
        }
    }
}

/// Write the terminal state for a still-running record. Returns `None`
/// when the record was already finished (e.g. stopped by request).
fn finish(
    inner: &Inner,
    id: &str,
    result: Result<String, String>,
) -> Option<SubagentRecord> {
    let mut records = inner.records.lock().expect("records lock poisoned");
    let entry = records.get_mut(id)?;
    if entry.record.status != SubagentStatus::Running {
        return None;
    }
    let now = Utc::now().timestamp_millis();
    entry.record.completed_at_ms = Some(now);
    entry.record.runtime_ms = Some(now - entry.record.created_at_ms);
    entry.cancel = None;
    match result {
        Ok(text) => {
            entry.record.status = SubagentStatus::Completed;
            entry.record.result = Some(text);
        }
        Err(message) => {
            entry.record.status = SubagentStatus::Failed;
            entry.record.error = Some(message);
        }
    }
    Some(entry.record.clone())
}

async fn execute_task(inner: &Arc<Inner>, id: &str) -> Result<String, SubagentError> {
    let (task, session_key, created_at_ms) = {
        let records = inner.records.lock().expect("records lock poisoned");
        let record = &records
            .get(id)
            .ok_or_else(|| SubagentError::NotFound(id.to_string()))?
            .record;
        (
            record.task.clone(),
            record.session_key.clone(),
            record.created_at_ms,
        )
    };

    let allowed = {
        let tools = inner.tools.lock().expect("tools lock poisoned");
        filter_for_subagent(&tools)
    };

    let mut options = inner.options_template.clone();
    options.custom_tools = allowed;
    options.is_subagent = true;
    options.session_dir = options
        .session_dir
        .join(sanitize_id(&session_key));
    options.resume = false;

    let session = inner.runtime.create_session(options).await?;

    let prompt = format!(
        "You are a subagent: a background worker spawned to complete one task.\n\
         Session key: {}\n\
         Created at: {}\n\
         You cannot schedule jobs, access shared memory, or spawn further \
         subagents. Report your findings as plain text when done.\n\n\
         Task: {}",
        session_key, created_at_ms, task
    );
    session.prompt(&prompt).await?;

    let text = session
        .last_assistant_text()
        .await
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Done".to_string());

    if let Err(e) = session.close().await {
        tracing::debug!(subagent = %id, "Subagent session close failed: {}", e);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedRuntime;

    fn setup() -> (ScriptedRuntime, Arc<MessageBus>, SubagentManager) {
        let runtime = ScriptedRuntime::new();
        let bus = Arc::new(MessageBus::new());
        let manager = SubagentManager::new(
            "worker",
            Arc::new(runtime.clone()),
            SessionOptions::new("test-model"),
            Arc::clone(&bus),
        );
        (runtime, bus, manager)
    }

    fn capture_channel(bus: &MessageBus, channel: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            channel,
            Box::new(move |msg: &OutboundMessage| {
                sink.lock().unwrap().push(msg.content.clone());
            }),
        );
        seen
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_spawn_completes_and_announces() {
        let (runtime, bus, manager) = setup();
        runtime.push_reply("found three issues");
        let seen = capture_channel(&bus, "cli");
        manager.set_routing_context("cli", "chat-1");

        let id = manager.spawn(SpawnRequest::new("audit the repo").label("audit"));
        wait_until(|| {
            manager
                .get(&id)
                .is_some_and(|r| r.status == SubagentStatus::Completed)
        })
        .await;

        let record = manager.get(&id).unwrap();
        assert_eq!(record.result.as_deref(), Some("found three issues"));
        assert_eq!(record.session_key, format!("subagent:worker:{}", id));
        assert!(record.runtime_ms.is_some());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0]
            .starts_with(&format!("[Subagent {} (audit) completed successfully]", id)));
        assert!(seen[0].contains("found three issues"));
        assert!(seen[0].contains("Runtime:"));
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let (runtime, bus, manager) = setup();
        runtime.set_create_delay(Duration::from_secs(5));
        let seen = capture_channel(&bus, "cli");
        manager.set_routing_context("cli", "chat-1");

        let id = manager.spawn(SpawnRequest::new("slow task").timeout_seconds(1));

        // Let the worker register its timers, then jump past the timeout.
        tokio::task::yield_now().await;
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::time::resume();

        wait_until(|| {
            manager
                .get(&id)
                .is_some_and(|r| r.status == SubagentStatus::Failed)
        })
        .await;

        let record = manager.get(&id).unwrap();
        assert_eq!(record.error.as_deref(), Some("Timeout exceeded"));
        assert!(seen.lock().unwrap()[0].contains("failed"));
    }

    #[tokio::test]
    async fn test_stop_running_subagent() {
        let (runtime, bus, manager) = setup();
        runtime.set_create_delay(Duration::from_secs(60));
        let seen = capture_channel(&bus, "cli");
        manager.set_routing_context("cli", "chat-1");

        let id = manager.spawn(SpawnRequest::new("never finishes"));
        assert!(manager.stop(&id));

        let record = manager.get(&id).unwrap();
        assert_eq!(record.status, SubagentStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("Stopped by request"));
        assert!(seen.lock().unwrap()[0].contains("stopped"));

        // Stopping again is a no-op.
        assert!(!manager.stop(&id));
        assert!(!manager.stop("missing"));
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let (runtime, _bus, manager) = setup();
        runtime.push_reply("done");
        manager.set_routing_context("cli", "chat-1");

        let finished = manager.spawn(SpawnRequest::new("quick"));
        wait_until(|| {
            manager
                .get(&finished)
                .is_some_and(|r| r.status == SubagentStatus::Completed)
        })
        .await;

        runtime.set_create_delay(Duration::from_secs(60));
        let running = manager.spawn(SpawnRequest::new("slow"));

        let all = manager.list(None);
        assert_eq!(all.len(), 2);
        let only_running = manager.list(Some(SubagentStatus::Running));
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, running);

        manager.stop(&running);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_running_records() {
        let (runtime, _bus, manager) = setup();
        runtime.push_reply("done");
        manager.set_routing_context("cli", "chat-1");

        let finished = manager.spawn(SpawnRequest::new("quick"));
        wait_until(|| {
            manager
                .get(&finished)
                .is_some_and(|r| r.status == SubagentStatus::Completed)
        })
        .await;

        runtime.set_create_delay(Duration::from_secs(60));
        let running = manager.spawn(SpawnRequest::new("slow"));

        // Zero max age: every finished record is past the cutoff.
        let removed = manager.cleanup(Duration::ZERO);
        assert_eq!(removed, 1);
        assert!(manager.get(&finished).is_none());
        assert!(manager.get(&running).is_some());

        manager.stop(&running);
    }

    #[tokio::test]
    async fn test_subagent_session_is_isolated() {
        let (runtime, _bus, manager) = setup();
        runtime.push_reply("done");
        manager.set_routing_context("cli", "chat-1");

        let id = manager.spawn(SpawnRequest::new("task"));
        wait_until(|| {
            manager
                .get(&id)
                .is_some_and(|r| r.status == SubagentStatus::Completed)
        })
        .await;

        // The subagent created its own session and closed it.
        let sessions = runtime.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_closed());
        let prompt = &sessions[0].prompts()[0];
        assert!(prompt.contains("subagent"));
        assert!(prompt.contains("Task: task"));
    }
}
