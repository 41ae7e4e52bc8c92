//! Client-side handle for one spawned agent.
//!
//! A handle talks to the agent server over its loopback HTTP API and
//! reaches back into the supervisor for teardown bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SupervisorError;
use crate::supervisor::{process_alive, Supervisor};

/// Cap on one `/chat` round trip.
const CHAT_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace between `/stop` and the fallback termination signal.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// A chat reply from the agent.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub response: String,
    pub session_id: String,
}

#[derive(Deserialize)]
struct ChatResponseBody {
    response: String,
    session_id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Handle to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    supervisor: Arc<Supervisor>,
    id: String,
    port: u16,
    pid: Option<u32>,
    client: reqwest::Client,
}

impl AgentHandle {
    pub(crate) fn new(
        supervisor: Arc<Supervisor>,
        id: &str,
        port: u16,
        pid: Option<u32>,
    ) -> Self {
        Self {
            supervisor,
            id: id.to_string(),
            port,
            pid,
            client: reqwest::Client::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// Send one chat turn. A `session_id` of `None` starts a fresh
    /// conversation; the reply carries the id to reuse for follow-ups.
    pub async fn chat(
        &self,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<ChatReply, SupervisorError> {
        let mut body = serde_json::json!({ "message": message });
        if let Some(session_id) = session_id {
            body["session_id"] = serde_json::Value::String(session_id.to_string());
        }

        let response = self
            .client
            .post(self.url("/chat"))
            .timeout(CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| SupervisorError::Request {
                id: self.id.clone(),
                message: e.to_string(),
            })?;

        if response.status().is_success() {
            let body: ChatResponseBody =
                response
                    .json()
                    .await
                    .map_err(|e| SupervisorError::Request {
                        id: self.id.clone(),
                        message: format!("malformed chat response: {}", e),
                    })?;
            return Ok(ChatReply {
                response: body.response,
                session_id: body.session_id,
            });
        }

        let status = response.status();
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("HTTP {}", status));
        Err(SupervisorError::Request {
            id: self.id.clone(),
            message,
        })
    }

    /// Whether the agent currently answers `/health`.
    pub async fn status(&self) -> bool {
        self.supervisor.probe_health(self.port).await
    }

    /// Stop the agent server: `/stop` first, then a termination signal if
    /// the process lingers.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        if let Err(e) = self.client.post(self.url("/stop")).send().await {
            tracing::debug!(agent = %self.id, "Stop request failed: {}", e);
        }
        tokio::time::sleep(STOP_GRACE).await;

        if let Some(pid) = self.pid {
            if process_alive(pid) {
                terminate(pid);
            }
        }
        self.supervisor.mark_stopped(&self.id).await;
        Ok(())
    }

    /// Stop the agent, then optionally remove its directory.
    pub async fn destroy(&self, cleanup: bool) -> Result<(), SupervisorError> {
        self.stop().await?;
        self.supervisor.forget(&self.id, cleanup).await
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    let _ = std::process::Command::new("kill")
        .arg("-15")
        .arg(pid.to_string())
        .output();
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TinycrabOptions;
    use crate::supervisor::SpawnOptions;

    #[tokio::test]
    async fn test_destroy_with_cleanup_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(TinycrabOptions::default().with_data_dir(dir.path()));
        supervisor.init().await.unwrap();

        // Fabricate a stopped agent on disk, as reconciliation would.
        let agent_dir = dir.path().join("agents").join("worker");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            agent_dir.join("meta.json"),
            r#"{ "createdAt": 1, "port": 9555 }"#,
        )
        .unwrap();
        supervisor.init().await.unwrap();

        let handle = supervisor.get("worker").await.unwrap();
        handle.destroy(true).await.unwrap();

        assert!(!agent_dir.exists());
        assert!(supervisor.list().await.is_empty());
        assert!(supervisor.get("worker").await.is_none());
    }

    #[tokio::test]
    async fn test_get_unknown_agent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(TinycrabOptions::default().with_data_dir(dir.path()));
        supervisor.init().await.unwrap();
        assert!(supervisor.get("ghost").await.is_none());

        // And spawn still reports the missing key rather than panicking.
        let mut options = TinycrabOptions::default().with_data_dir(dir.path());
        options.provider = "nokey".to_string();
        let supervisor = Supervisor::new(options);
        supervisor.init().await.unwrap();
        assert!(supervisor
            .spawn("ghost", SpawnOptions::default())
            .await
            .is_err());
    }
}
