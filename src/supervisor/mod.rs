//! Supervisor backend.
//!
//! The supervisor owns the set of agent records and the mapping to OS
//! processes. It allocates ports, forks per-agent server processes with
//! the API key handed over on stdin, and reconciles live processes with
//! on-disk metadata (`meta.json` + `server.pid`) across its own restarts.

pub mod handle;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::{provider_key_env_var, TinycrabOptions, DEFAULT_START_PORT};
use crate::error::SupervisorError;
use crate::session::key::sanitize_id;

pub use handle::{AgentHandle, ChatReply};

/// Cap per `/health` probe attempt.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Readiness poll: 200ms between attempts, 30 attempts (~6s).
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const READY_POLL_ATTEMPTS: u32 = 30;

/// Grace period after broadcasting `/stop` during `close`.
const CLOSE_GRACE: Duration = Duration::from_millis(200);

/// Agent liveness as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentStatus {
    Running,
    Stopped,
}

/// One agent record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub status: AgentStatus,
    pub workspace: PathBuf,
    pub sessions_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Persisted per-agent metadata (`meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentMeta {
    created_at: i64,
    port: u16,
}

/// Per-spawn overrides.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<SecretString>,
}

struct AgentSlot {
    info: AgentInfo,
    child: Option<tokio::process::Child>,
}

struct SupervisorState {
    agents: HashMap<String, AgentSlot>,
    /// Next candidate port. Allocation is serialized by the state lock.
    next_port: u16,
}

/// The supervisor: port allocation, process spawn, secret handoff, and
/// reconciliation with on-disk state.
pub struct Supervisor {
    options: TinycrabOptions,
    state: Mutex<SupervisorState>,
    client: reqwest::Client,
}

impl Supervisor {
    pub fn new(options: TinycrabOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            state: Mutex::new(SupervisorState {
                agents: HashMap::new(),
                next_port: DEFAULT_START_PORT,
            }),
            client: reqwest::Client::new(),
        })
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.options.data_dir
    }

    /// Create the data layout and reconcile records with reality.
    ///
    /// For every agent directory carrying a `meta.json`, the record is
    /// reconstructed. A live `server.pid` whose process answers `/health`
    /// keeps the agent `running`; anything else erases the pid file and
    /// marks it `stopped`.
    pub async fn init(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let agents_dir = self.options.agents_dir();
        tokio::fs::create_dir_all(&agents_dir).await?;

        let mut entries = tokio::fs::read_dir(&agents_dir).await?;
        let mut state = self.state.lock().await;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            let agent_dir = entry.path();
            let meta_path = agent_dir.join("meta.json");
            let meta = match tokio::fs::read_to_string(&meta_path).await {
                Ok(content) => match serde_json::from_str::<AgentMeta>(&content) {
                    Ok(meta) => meta,
                    Err(e) => {
                        tracing::warn!(path = %meta_path.display(), "Skipping corrupt meta.json: {}", e);
                        continue;
                    }
                },
                Err(_) => continue,
            };

            let pid = read_pid_file(&agent_dir).await;
            let alive = match pid {
                Some(pid) if process_alive(pid) => {
                    self.probe_health(meta.port).await
                }
                _ => false,
            };
            if !alive {
                let _ = tokio::fs::remove_file(agent_dir.join("server.pid")).await;
            }

            // Future allocation starts past every recorded port.
            state.next_port = state.next_port.max(meta.port.saturating_add(1));

            let info = AgentInfo {
                id: id.clone(),
                status: if alive {
                    AgentStatus::Running
                } else {
                    AgentStatus::Stopped
                },
                workspace: agent_dir.join("workspace"),
                sessions_dir: agent_dir.join("sessions"),
                memory_dir: agent_dir.join("memory"),
                created_at: meta.created_at,
                port: Some(meta.port),
                pid: if alive { pid } else { None },
            };
            tracing::info!(
                agent = %id,
                status = ?info.status,
                port = meta.port,
                "Reconciled agent"
            );
            state.agents.insert(id, AgentSlot { info, child: None });
        }
        Ok(())
    }

    /// Spawn an agent server, or return the existing handle when the
    /// agent is already running.
    pub async fn spawn(
        self: &Arc<Self>,
        id: &str,
        opts: SpawnOptions,
    ) -> Result<AgentHandle, SupervisorError> {
        let id = sanitize_id(id);
        let mut state = self.state.lock().await;

        if let Some(slot) = state.agents.get(&id) {
            if slot.info.status == AgentStatus::Running {
                if let Some(port) = slot.info.port {
                    return Ok(AgentHandle::new(Arc::clone(self), &id, port, slot.info.pid));
                }
            }
        }

        let agent_dir = self.options.agents_dir().join(&id);
        for sub in ["workspace", "sessions", "memory"] {
            tokio::fs::create_dir_all(agent_dir.join(sub)).await?;
        }

        // Reuse the recorded port when the agent existed before.
        let recorded_port = state.agents.get(&id).and_then(|slot| slot.info.port);
        let port = match recorded_port {
            Some(port) => port,
            None => self.allocate_port(&mut state).await?,
        };

        let created_at = state
            .agents
            .get(&id)
            .map(|slot| slot.info.created_at)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let provider = opts
            .provider
            .clone()
            .unwrap_or_else(|| self.options.provider.clone());
        let model = opts
            .model
            .clone()
            .unwrap_or_else(|| self.options.model.clone());
        let api_key = opts
            .api_key
            .clone()
            .or_else(|| self.options.api_key.clone())
            .or_else(|| {
                std::env::var(provider_key_env_var(&provider))
                    .ok()
                    .map(SecretString::from)
            })
            .ok_or_else(|| SupervisorError::SpawnFailed {
                id: id.clone(),
                reason: format!(
                    "no API key: set {} or pass one explicitly",
                    provider_key_env_var(&provider)
                ),
            })?;

        let mut child = spawn_agent_process(&id, port, &self.options.data_dir, &provider, &model)
            .map_err(|e| SupervisorError::SpawnFailed {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        // The key goes through stdin only: never argv, never environment.
        if let Some(mut stdin) = child.stdin.take() {
            let mut line = api_key.expose_secret().to_string();
            line.push('\n');
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| SupervisorError::SpawnFailed {
                    id: id.clone(),
                    reason: format!("failed to write key to child stdin: {}", e),
                })?;
            // Dropping the handle closes the stream.
        }

        let mut ready = false;
        for _ in 0..READY_POLL_ATTEMPTS {
            tokio::time::sleep(READY_POLL_INTERVAL).await;
            if self.probe_health(port).await {
                ready = true;
                break;
            }
        }
        if !ready {
            let _ = child.kill().await;
            return Err(SupervisorError::NotReady { id });
        }

        let pid = child.id();
        let meta = AgentMeta { created_at, port };
        let meta_encoded = serde_json::to_string_pretty(&meta)
            .map_err(|e| SupervisorError::SpawnFailed {
                id: id.clone(),
                reason: format!("failed to encode meta.json: {}", e),
            })?;
        tokio::fs::write(agent_dir.join("meta.json"), meta_encoded).await?;

        let info = AgentInfo {
            id: id.clone(),
            status: AgentStatus::Running,
            workspace: agent_dir.join("workspace"),
            sessions_dir: agent_dir.join("sessions"),
            memory_dir: agent_dir.join("memory"),
            created_at,
            port: Some(port),
            pid,
        };
        state.agents.insert(
            id.clone(),
            AgentSlot {
                info,
                child: Some(child),
            },
        );

        tracing::info!(agent = %id, port = port, "Agent spawned");
        Ok(AgentHandle::new(Arc::clone(self), &id, port, pid))
    }

    /// Handle for an agent known to the supervisor.
    pub async fn get(self: &Arc<Self>, id: &str) -> Option<AgentHandle> {
        let id = sanitize_id(id);
        let state = self.state.lock().await;
        state.agents.get(&id).and_then(|slot| {
            slot.info
                .port
                .map(|port| AgentHandle::new(Arc::clone(self), &id, port, slot.info.pid))
        })
    }

    /// All agent records, with status refreshed via `/health`.
    pub async fn list(self: &Arc<Self>) -> Vec<AgentInfo> {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state.agents.keys().cloned().collect();
        for id in ids {
            let port = state.agents.get(&id).and_then(|slot| slot.info.port);
            let healthy = match port {
                Some(port) => self.probe_health(port).await,
                None => false,
            };
            if let Some(slot) = state.agents.get_mut(&id) {
                if healthy {
                    slot.info.status = AgentStatus::Running;
                } else {
                    slot.info.status = AgentStatus::Stopped;
                    slot.info.pid = None;
                }
            }
        }
        let mut infos: Vec<AgentInfo> =
            state.agents.values().map(|slot| slot.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Stop every running agent and discard handles.
    pub async fn close(self: &Arc<Self>) {
        let targets: Vec<(String, u16)> = {
            let state = self.state.lock().await;
            state
                .agents
                .values()
                .filter(|slot| slot.info.status == AgentStatus::Running)
                .filter_map(|slot| slot.info.port.map(|port| (slot.info.id.clone(), port)))
                .collect()
        };
        for (id, port) in &targets {
            let url = format!("http://127.0.0.1:{}/stop", port);
            if let Err(e) = self.client.post(&url).send().await {
                tracing::debug!(agent = %id, "Stop request failed: {}", e);
            }
        }
        if !targets.is_empty() {
            tokio::time::sleep(CLOSE_GRACE).await;
        }
        let mut state = self.state.lock().await;
        state.agents.clear();
    }

    /// `true` when `/health` answers successfully within the probe cap.
    pub(crate) async fn probe_health(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/health", port);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Find a free port. A port is free when `/health` does not answer.
    /// Serialized by the state lock held by the caller.
    async fn allocate_port(
        &self,
        state: &mut SupervisorState,
    ) -> Result<u16, SupervisorError> {
        loop {
            let candidate = state.next_port;
            state.next_port = state.next_port.checked_add(1).ok_or_else(|| {
                SupervisorError::SpawnFailed {
                    id: String::new(),
                    reason: "port space exhausted".to_string(),
                }
            })?;
            if !self.probe_health(candidate).await {
                return Ok(candidate);
            }
            tracing::debug!(port = candidate, "Port busy, trying next");
        }
    }

    /// Drop an agent from the registry, optionally removing its
    /// directory. Used by [`AgentHandle::destroy`].
    pub(crate) async fn forget(&self, id: &str, cleanup: bool) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        state.agents.remove(id);
        drop(state);
        if cleanup {
            let dir = self.options.agents_dir().join(id);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Record that an agent was stopped through its handle.
    pub(crate) async fn mark_stopped(&self, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.agents.get_mut(id) {
            slot.info.status = AgentStatus::Stopped;
            slot.info.pid = None;
            slot.child = None;
        }
    }
}

fn spawn_agent_process(
    id: &str,
    port: u16,
    data_dir: &PathBuf,
    provider: &str,
    model: &str,
) -> std::io::Result<tokio::process::Child> {
    let exe = agent_server_executable();
    tracing::debug!(exe = %exe.display(), agent = %id, "Launching agent server");
    tokio::process::Command::new(exe)
        .arg("--id")
        .arg(id)
        .arg("--port")
        .arg(port.to_string())
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--provider")
        .arg(provider)
        .arg("--model")
        .arg(model)
        // Key arrives on stdin; stdout is discarded, stderr stays visible
        // so crashes show up in the supervisor's terminal.
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
}

/// Path of the `tinycrab-agent` binary: next to the current executable
/// when present, else resolved via `PATH`.
fn agent_server_executable() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("tinycrab-agent");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("tinycrab-agent")
}

async fn read_pid_file(agent_dir: &std::path::Path) -> Option<u32> {
    let content = tokio::fs::read_to_string(agent_dir.join("server.pid"))
        .await
        .ok()?;
    content.trim().parse().ok()
}

/// Signal 0 liveness check.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Fall back to the health probe alone.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_in(dir: &tempfile::TempDir) -> TinycrabOptions {
        TinycrabOptions::default().with_data_dir(dir.path())
    }

    #[tokio::test]
    async fn test_init_creates_agents_dir() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(options_in(&dir));
        supervisor.init().await.unwrap();
        assert!(dir.path().join("agents").is_dir());
        assert!(supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_init_reconciles_stopped_agent_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("agents").join("worker");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            agent_dir.join("meta.json"),
            r#"{ "createdAt": 1700000000000, "port": 9123 }"#,
        )
        .unwrap();
        // A stale pid file for a process that does not exist.
        std::fs::write(agent_dir.join("server.pid"), "999999999").unwrap();

        let supervisor = Supervisor::new(options_in(&dir));
        supervisor.init().await.unwrap();

        let agents = supervisor.list().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "worker");
        assert_eq!(agents[0].status, AgentStatus::Stopped);
        assert_eq!(agents[0].port, Some(9123));
        assert_eq!(agents[0].created_at, 1_700_000_000_000);
        // The stale pid file was erased.
        assert!(!agent_dir.join("server.pid").exists());

        // Port allocation starts past the recorded port.
        let state = supervisor.state.lock().await;
        assert!(state.next_port > 9123);
    }

    #[tokio::test]
    async fn test_init_skips_corrupt_meta() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("agents").join("broken");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(agent_dir.join("meta.json"), "{oops").unwrap();

        let supervisor = Supervisor::new(options_in(&dir));
        supervisor.init().await.unwrap();
        assert!(supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_without_key_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options_in(&dir);
        options.provider = "noexist".to_string();
        let supervisor = Supervisor::new(options);
        supervisor.init().await.unwrap();

        let result = supervisor.spawn("worker", SpawnOptions::default()).await;
        assert!(matches!(
            result,
            Err(SupervisorError::SpawnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let meta = AgentMeta {
            created_at: 123,
            port: 9000,
        };
        let encoded = serde_json::to_string(&meta).unwrap();
        assert!(encoded.contains("\"createdAt\":123"));
        assert!(encoded.contains("\"port\":9000"));
        let decoded: AgentMeta = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.created_at, 123);
        assert_eq!(decoded.port, 9000);
    }
}
