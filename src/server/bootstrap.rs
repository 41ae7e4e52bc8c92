//! Agent-server startup protocol.
//!
//! The supervisor launches this process with `--id/--port/--data-dir/
//! --provider/--model`, then writes the API key to its stdin. The key is
//! read within one second; if stdin is interactive or silent, the
//! provider's environment variable is consumed instead (and removed from
//! the process environment). The key only ever lives in the in-memory
//! auth store handed to the LLM façade.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use crate::config::provider_key_env_var;
use crate::error::ServerError;
use crate::llm::{AuthStore, ChatRuntime, SessionOptions};
use crate::memory::MemoryStore;
use crate::orchestrator::Orchestrator;
use crate::server::{router, ServerState};
use crate::session::key::{sanitize_id, SessionKeyParts};
use crate::session::manager::{OptionsFactory, SessionManagerConfig};
use crate::session::SessionManager;
use crate::subagent::SubagentManager;
use crate::tools::builtin::build_agent_tools;
use crate::cron::CronService;

/// How long to wait for the API key on stdin.
const STDIN_KEY_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay between the `/stop` response and process exit, so the response
/// can flush.
const STOP_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Command-line arguments passed by the supervisor. Environment
/// variables back each flag for standalone runs.
#[derive(Debug, Parser)]
#[command(name = "tinycrab-agent", about = "tinycrab per-agent server")]
pub struct AgentServerArgs {
    /// Agent identifier; becomes the directory name under the data dir.
    #[arg(long)]
    pub id: String,

    /// Loopback port to bind.
    #[arg(long, env = "AGENT_PORT")]
    pub port: u16,

    /// Supervisor data directory.
    #[arg(long, env = "AGENT_DATA_DIR")]
    pub data_dir: PathBuf,

    /// LLM provider name.
    #[arg(long, env = "AGENT_PROVIDER", default_value = crate::config::DEFAULT_PROVIDER)]
    pub provider: String,

    /// Model identifier.
    #[arg(long, env = "AGENT_MODEL", default_value = crate::config::DEFAULT_MODEL)]
    pub model: String,

    /// Workspace override; defaults to `<data-dir>/agents/<id>/workspace`.
    #[arg(long, env = "AGENT_WORKSPACE")]
    pub workspace: Option<PathBuf>,
}

/// Removes `server.pid` on every exit path.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn write(dir: &Path) -> Result<Self, ServerError> {
        let path = dir.join("server.pid");
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove pid file: {}", e);
            }
        }
    }
}

/// Read the API key: one stdin line within the timeout, else the
/// provider's environment variable (which is then deleted).
async fn read_api_key(provider: &str) -> Result<AuthStore, ServerError> {
    let mut auth = AuthStore::new();

    if !std::io::stdin().is_terminal() {
        let line = tokio::time::timeout(STDIN_KEY_TIMEOUT, async {
            let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
            let mut line = String::new();
            reader.read_line(&mut line).await.map(|_| line)
        })
        .await;

        if let Ok(Ok(line)) = line {
            let key = line.trim();
            if !key.is_empty() {
                auth.insert(provider, secrecy::SecretString::from(key.to_string()));
                return Ok(auth);
            }
        }
    }

    if auth.consume_env(provider) {
        return Ok(auth);
    }
    Err(ServerError::MissingApiKey {
        env_var: provider_key_env_var(provider),
    })
}

/// Run the agent server until a termination signal or `/stop` arrives.
pub async fn run(args: AgentServerArgs) -> Result<(), ServerError> {
    let agent_id = sanitize_id(&args.id);
    let auth = read_api_key(&args.provider).await?;

    let agent_dir = args.data_dir.join("agents").join(&agent_id);
    let workspace = args
        .workspace
        .clone()
        .unwrap_or_else(|| agent_dir.join("workspace"));
    let sessions_dir = agent_dir.join("sessions");
    let memory_dir = agent_dir.join("memory");
    for dir in [&workspace, &sessions_dir, &memory_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let bus = Arc::new(crate::bus::MessageBus::new());
    let memory = Arc::new(
        MemoryStore::open(&memory_dir)
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e.to_string())))?,
    );
    let runtime = Arc::new(ChatRuntime::new(args.provider.clone()));

    // The factory is completed below once the tool list exists.
    let base_options = SessionOptions::new(args.model.clone())
        .with_workspace(workspace.clone())
        .with_auth(auth);

    let subagents = Arc::new(SubagentManager::new(
        agent_id.clone(),
        runtime.clone(),
        base_options
            .clone()
            .with_session_dir(sessions_dir.clone()),
        Arc::clone(&bus),
    ));

    let factory_options = base_options.clone();
    let factory_sessions_dir = sessions_dir.clone();
    let tools_cell: Arc<std::sync::OnceLock<Vec<Arc<dyn crate::tools::Tool>>>> =
        Arc::new(std::sync::OnceLock::new());
    let factory_tools = Arc::clone(&tools_cell);
    let options: OptionsFactory = Arc::new(move |parts: &SessionKeyParts| {
        let mut options = factory_options
            .clone()
            .with_session_dir(factory_sessions_dir.join(sanitize_id(&parts.key())));
        if let Some(tools) = factory_tools.get() {
            options.custom_tools = tools.clone();
        }
        options
    });

    let sessions = Arc::new(SessionManager::new(
        runtime,
        options,
        SessionManagerConfig::default(),
    ));
    sessions.start_cleanup();

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&bus),
        Arc::clone(&sessions),
        Arc::clone(&subagents),
    ));
    let cron = Arc::new(CronService::new(
        agent_dir.join("cron.json"),
        orchestrator.cron_executor(),
    ));
    cron.start()
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e.to_string())))?;

    let tools = build_agent_tools(Arc::clone(&memory), Arc::clone(&cron), Arc::clone(&subagents));
    subagents.set_available_tools(tools.clone());
    let _ = tools_cell.set(tools);

    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run().await });
    }
    {
        let cron = Arc::clone(&cron);
        tokio::spawn(async move { Orchestrator::watch_cron_events(cron).await });
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let state = ServerState {
        agent_id: agent_id.clone(),
        port: args.port,
        pid: std::process::id(),
        workspace,
        sessions_dir,
        memory_dir,
        sessions: Arc::clone(&sessions),
        memory: Arc::clone(&memory),
        shutdown: shutdown_tx,
    };

    let listener =
        tokio::net::TcpListener::bind(("127.0.0.1", args.port))
            .await
            .map_err(|source| ServerError::Bind {
                port: args.port,
                source,
            })?;

    // From here on, the pid file must disappear on every exit path.
    let pid_file = PidFile::write(&agent_dir)?;
    tracing::info!(agent = %agent_id, port = args.port, "Agent server listening");

    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = shutdown_rx.recv() => {
                            tokio::time::sleep(STOP_FLUSH_DELAY).await;
                        }
                    }
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
                _ = shutdown_rx.recv() => {
                    tokio::time::sleep(STOP_FLUSH_DELAY).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = shutdown_rx.recv() => {
                    tokio::time::sleep(STOP_FLUSH_DELAY).await;
                }
            }
        }
    };

    let serve = axum::serve(listener, router(state)).with_graceful_shutdown(shutdown);
    let result = serve.await;

    cron.stop().await;
    sessions.close().await;
    memory.close().await;
    drop(pid_file);

    result.map_err(ServerError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_guard_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        {
            let _guard = PidFile::write(dir.path()).unwrap();
            let written = std::fs::read_to_string(&path).unwrap();
            assert_eq!(written, std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_args_parse() {
        let args = AgentServerArgs::parse_from([
            "tinycrab-agent",
            "--id",
            "worker",
            "--port",
            "9001",
            "--data-dir",
            "/tmp/data",
        ]);
        assert_eq!(args.id, "worker");
        assert_eq!(args.port, 9001);
        assert_eq!(args.provider, "openai");
        assert_eq!(args.model, "gpt-4o");
    }
}
