//! In-process orchestrator: the dispatch loop gluing the bus, session
//! cache, subagent pool and cron service together inside one agent
//! process.
//!
//! The loop consumes inbound messages one at a time, updates the subagent
//! routing context, handles the few built-in commands, and otherwise runs
//! a full agent turn, publishing the reply on the originating channel.

use std::sync::Arc;

use futures::FutureExt;

use crate::bus::{BusMessage, MessageBus, OutboundMessage};
use crate::cron::{CronEvent, CronJob, CronPayload, CronService, ExecuteJob};
use crate::error::{CronError, SessionError};
use crate::session::key::SessionKeyParts;
use crate::session::SessionManager;
use crate::subagent::{SpawnRequest, SubagentManager};

/// Channel used for cron-driven turns and events.
pub const CRON_CHANNEL: &str = "cron";

/// Context-usage fraction above which a memory flush runs before the turn.
pub const DEFAULT_FLUSH_THRESHOLD: f64 = 0.80;

/// Reply token that suppresses a flush response.
const NO_REPLY: &str = "NO_REPLY";

/// The silent prompt issued before compaction-risky turns.
const FLUSH_PROMPT: &str = "Context is nearly full. If there is anything from this \
conversation worth preserving, call the `remember` tool for each item now. \
If there is nothing to save, reply with exactly NO_REPLY.";

/// Glue between the bus, the session cache, subagents and cron.
pub struct Orchestrator {
    bus: Arc<MessageBus>,
    sessions: Arc<SessionManager>,
    subagents: Arc<SubagentManager>,
    flush_threshold: f64,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<MessageBus>,
        sessions: Arc<SessionManager>,
        subagents: Arc<SubagentManager>,
    ) -> Self {
        Self {
            bus,
            sessions,
            subagents,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    pub fn with_flush_threshold(mut self, threshold: f64) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Consume inbound messages forever.
    pub async fn run(&self) {
        loop {
            let message = self.bus.consume_inbound().await;
            self.dispatch(message).await;
        }
    }

    /// Handle one inbound message.
    pub async fn dispatch(&self, message: BusMessage) {
        self.subagents
            .set_routing_context(message.channel.clone(), message.chat_id.clone());

        let reply = if let Some(task) = message.content.strip_prefix("/spawn ") {
            let id = self.subagents.spawn(SpawnRequest::new(task.trim()));
            format!("Subagent {} started.", id)
        } else if message.content.trim() == "/status" {
            format!(
                "Sessions: {}. Subagents running: {}.",
                self.sessions.active_sessions().await,
                self.subagents
                    .list(Some(crate::subagent::SubagentStatus::Running))
                    .len()
            )
        } else {
            match self.run_turn(&message).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(
                        channel = %message.channel,
                        chat_id = %message.chat_id,
                        "Turn failed: {}", e
                    );
                    format!("Error: {}", e)
                }
            }
        };

        self.bus.publish_outbound(&OutboundMessage::new(
            message.channel,
            message.chat_id,
            reply,
        ));
    }

    /// One full agent turn, with the pre-compaction memory flush.
    async fn run_turn(&self, message: &BusMessage) -> Result<String, SessionError> {
        let parts = SessionKeyParts::new(message.channel.clone(), message.chat_id.clone());
        let flush_threshold = self.flush_threshold;
        let content = message.content.clone();

        self.sessions
            .with_session(&parts, |session| async move {
                maybe_flush_memory(session.as_ref(), flush_threshold).await;
                session.prompt(&content).await?;
                Ok(session.last_assistant_text().await.unwrap_or_default())
            })
            .await
    }

    /// The cron execution callback: routes payloads through the bus or a
    /// session turn.
    pub fn cron_executor(&self) -> ExecuteJob {
        let bus = Arc::clone(&self.bus);
        let sessions = Arc::clone(&self.sessions);
        let flush_threshold = self.flush_threshold;

        Arc::new(move |job: CronJob| {
            let bus = Arc::clone(&bus);
            let sessions = Arc::clone(&sessions);
            async move { execute_cron_payload(bus, sessions, flush_threshold, job).await }.boxed()
        })
    }

    /// Log cron execution events. Spawn this alongside `run`.
    pub async fn watch_cron_events(cron: Arc<CronService>) {
        let mut events = cron.subscribe();
        while let Ok(event) = events.recv().await {
            match event {
                CronEvent::Run { job, .. } => {
                    tracing::info!(job = %job.name, id = %job.id, "Cron job ran");
                }
                CronEvent::Error { job, error } => {
                    tracing::warn!(job = %job.name, id = %job.id, "Cron job failed: {}", error);
                }
                CronEvent::Skip { job } => {
                    tracing::debug!(job = %job.name, id = %job.id, "Cron job skipped");
                }
            }
        }
    }
}

async fn execute_cron_payload(
    bus: Arc<MessageBus>,
    sessions: Arc<SessionManager>,
    flush_threshold: f64,
    job: CronJob,
) -> Result<Option<String>, CronError> {
    match job.payload.clone() {
        CronPayload::SystemEvent { text } => {
            bus.publish_inbound(BusMessage::new(CRON_CHANNEL, job.id.clone(), text));
            Ok(None)
        }
        CronPayload::AgentTurn {
            message,
            deliver,
            channel,
            chat_id,
        } => {
            let parts = SessionKeyParts::new(CRON_CHANNEL, job.id.clone());
            let reply = sessions
                .with_session(&parts, |session| {
                    let message = message.clone();
                    async move {
                        maybe_flush_memory(session.as_ref(), flush_threshold).await;
                        session.prompt(&message).await?;
                        Ok(session.last_assistant_text().await.unwrap_or_default())
                    }
                })
                .await
                .map_err(|e| CronError::Execution(e.to_string()))?;

            if deliver.unwrap_or(false) {
                bus.publish_outbound(&OutboundMessage::new(
                    channel.unwrap_or_else(|| CRON_CHANNEL.to_string()),
                    chat_id.unwrap_or_else(|| job.id.clone()),
                    reply.clone(),
                ));
            }
            Ok(Some(reply))
        }
    }
}

/// Issue a silent memory-flush turn when the session is close to
/// compaction. Failures are logged and ignored; the flush reply is never
/// surfaced to the caller.
async fn maybe_flush_memory(session: &dyn crate::llm::LlmSession, threshold: f64) {
    let Some(usage) = session.context_usage().await else {
        return;
    };
    if usage.percent < threshold {
        return;
    }
    tracing::info!(
        percent = usage.percent,
        "Context nearly full, flushing memory"
    );
    match session.prompt(FLUSH_PROMPT).await {
        Ok(()) => {
            if let Some(text) = session.last_assistant_text().await {
                if text.trim() != NO_REPLY {
                    tracing::debug!("Memory flush saved context notes");
                }
            }
        }
        Err(e) => {
            tracing::warn!("Memory flush failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::{CronJobInput, RunMode, Schedule};
    use crate::llm::{ScriptedRuntime, SessionOptions};
    use crate::session::manager::{OptionsFactory, SessionManagerConfig};
    use std::sync::Mutex;

    struct Fixture {
        runtime: ScriptedRuntime,
        bus: Arc<MessageBus>,
        orchestrator: Orchestrator,
    }

    fn fixture() -> Fixture {
        let runtime = ScriptedRuntime::new();
        let bus = Arc::new(MessageBus::new());
        let options: OptionsFactory = Arc::new(|_parts| SessionOptions::new("test-model"));
        let sessions = Arc::new(SessionManager::new(
            Arc::new(runtime.clone()),
            options,
            SessionManagerConfig::default(),
        ));
        let subagents = Arc::new(SubagentManager::new(
            "worker",
            Arc::new(runtime.clone()),
            SessionOptions::new("test-model"),
            Arc::clone(&bus),
        ));
        let orchestrator =
            Orchestrator::new(Arc::clone(&bus), sessions, subagents);
        Fixture {
            runtime,
            bus,
            orchestrator,
        }
    }

    fn capture(bus: &MessageBus, channel: &str) -> Arc<Mutex<Vec<String>>> {
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

    #[tokio::test]
    async fn test_dispatch_replies_on_originating_channel() {
        let f = fixture();
        f.runtime.push_reply("hello back");
        let seen = capture(&f.bus, "cli");

        f.orchestrator
            .dispatch(BusMessage::new("cli", "chat-1", "hello"))
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["hello back".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_command_starts_subagent() {
        let f = fixture();
        let seen = capture(&f.bus, "cli");

        f.orchestrator
            .dispatch(BusMessage::new("cli", "chat-1", "/spawn scan the logs"))
            .await;

        let seen = seen.lock().unwrap();
        assert!(seen[0].starts_with("Subagent "));
        assert!(seen[0].ends_with("started."));
    }

    #[tokio::test]
    async fn test_status_command_is_synthetic() {
        let f = fixture();
        let seen = capture(&f.bus, "cli");

        f.orchestrator
            .dispatch(BusMessage::new("cli", "chat-1", "/status"))
            .await;

        assert!(seen.lock().unwrap()[0].starts_with("Sessions:"));
        // No LLM session was touched.
        assert_eq!(f.runtime.created_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cron_system_event_publishes_inbound() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let cron = Arc::new(CronService::new(
            dir.path().join("cron.json"),
            f.orchestrator.cron_executor(),
        ));
        cron.start().await.unwrap();

        let job = cron
            .add(CronJobInput::new(
                "tick",
                Schedule::Every {
                    every_ms: 3_600_000,
                    anchor_ms: None,
                },
                CronPayload::SystemEvent {
                    text: "time to check".to_string(),
                },
            ))
            .await
            .unwrap();
        cron.run(&job.id, RunMode::Force).await.unwrap();

        let inbound = f.bus.consume_inbound().await;
        assert_eq!(inbound.channel, CRON_CHANNEL);
        assert_eq!(inbound.chat_id, job.id);
        assert_eq!(inbound.content, "time to check");
        cron.stop().await;
    }

    #[tokio::test]
    async fn test_cron_agent_turn_delivers_reply() {
        let f = fixture();
        f.runtime.push_reply("daily summary ready");
        let seen = capture(&f.bus, "cli");

        let dir = tempfile::tempdir().unwrap();
        let cron = Arc::new(CronService::new(
            dir.path().join("cron.json"),
            f.orchestrator.cron_executor(),
        ));
        cron.start().await.unwrap();

        let job = cron
            .add(CronJobInput::new(
                "summary",
                Schedule::Every {
                    every_ms: 3_600_000,
                    anchor_ms: None,
                },
                CronPayload::AgentTurn {
                    message: "summarize the day".to_string(),
                    deliver: Some(true),
                    channel: Some("cli".to_string()),
                    chat_id: Some("chat-9".to_string()),
                },
            ))
            .await
            .unwrap();
        let result = cron.run(&job.id, RunMode::Force).await.unwrap();

        assert_eq!(result.as_deref(), Some("daily summary ready"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["daily summary ready".to_string()]
        );
        cron.stop().await;
    }

    #[tokio::test]
    async fn test_memory_flush_runs_before_turn_when_context_is_full() {
        let f = fixture();
        // Replies: warm-up turn, flush prompt, then the real turn.
        f.runtime.push_reply("warmed");
        f.runtime.push_reply("NO_REPLY");
        f.runtime.push_reply("the answer");
        let seen = capture(&f.bus, "cli");

        // Prime the session so we can inject a usage value.
        f.orchestrator
            .dispatch(BusMessage::new("cli", "chat-1", "warm up"))
            .await;
        f.runtime.sessions()[0].set_usage(0.9);

        f.orchestrator
            .dispatch(BusMessage::new("cli", "chat-1", "real question"))
            .await;

        let prompts = f.runtime.sessions()[0].prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("remember"));
        assert_eq!(prompts[2], "real question");
        // The flush reply is not surfaced to the caller.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], "the answer");
    }
}
