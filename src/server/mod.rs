//! Per-agent HTTP server.
//!
//! One server per agent, bound to loopback. It owns the agent's session
//! cache and memory store; `/chat` multiplexes concurrent conversations
//! while per-session turns serialize through the session manager.

pub mod bootstrap;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::memory::MemoryStore;
use crate::session::key::SessionKeyParts;
use crate::session::SessionManager;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ServerState {
    pub agent_id: String,
    pub port: u16,
    pub pid: u32,
    pub workspace: PathBuf,
    pub sessions_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub sessions: Arc<SessionManager>,
    pub memory: Arc<MemoryStore>,
    /// Signals the serve loop to shut down (used by `/stop`).
    pub shutdown: mpsc::Sender<()>,
}

/// Build the axum router for an agent server.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/chat", post(chat))
        .route("/sessions", get(sessions))
        .route("/stop", post(stop))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    agent: String,
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        agent: state.agent_id.clone(),
    })
}

#[derive(Serialize)]
struct InfoResponse {
    id: String,
    status: &'static str,
    port: u16,
    pid: u32,
    workspace: String,
    #[serde(rename = "sessionsDir")]
    sessions_dir: String,
    #[serde(rename = "memoryDir")]
    memory_dir: String,
    #[serde(rename = "activeSessions")]
    active_sessions: usize,
}

async fn info(State(state): State<ServerState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        id: state.agent_id.clone(),
        status: "running",
        port: state.port,
        pid: state.pid,
        workspace: state.workspace.display().to_string(),
        sessions_dir: state.sessions_dir.display().to_string(),
        memory_dir: state.memory_dir.display().to_string(),
        active_sessions: state.sessions.active_sessions().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

async fn chat(
    State(state): State<ServerState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorResponse>)> {
    let message = match request.message.as_deref().map(str::trim) {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "message is required".to_string(),
                }),
            ))
        }
    };

    let session_id = resolve_session_id(request.session_id.as_deref());
    let parts = SessionKeyParts::new("http", session_id.clone());

    let reply = state
        .sessions
        .with_session(&parts, |session| {
            let message = message.clone();
            async move {
                session.prompt(&message).await?;
                Ok(session.last_assistant_text().await.unwrap_or_default())
            }
        })
        .await
        .map_err(|e| {
            tracing::error!(session_id = %session_id, "Chat turn failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })?;

    Ok(Json(ChatResponse {
        response: reply,
        session_id,
    }))
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<String>,
}

async fn sessions(State(state): State<ServerState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.sessions.list_sessions().await,
    })
}

#[derive(Serialize)]
struct StopResponse {
    status: &'static str,
}

async fn stop(State(state): State<ServerState>) -> Json<StopResponse> {
    tracing::info!(agent = %state.agent_id, "Stop requested");
    let _ = state.shutdown.try_send(());
    Json(StopResponse { status: "stopping" })
}

/// Apply the session-id rules for `/chat`.
///
/// - absent: mint `session-<16 hex>`;
/// - already carrying a 16-hex suffix: trusted and reused verbatim;
/// - anything else: harden by appending a fresh 16-hex suffix, so a
///   caller cannot collide with another caller's chosen id.
pub fn resolve_session_id(requested: Option<&str>) -> String {
    match requested.map(str::trim) {
        None | Some("") => format!("session-{}", random_hex16()),
        Some(id) if has_hex16_suffix(id) => id.to_string(),
        Some(id) => format!("{}-{}", id, random_hex16()),
    }
}

fn has_hex16_suffix(id: &str) -> bool {
    // Matches `.+-[0-9a-f]{16}` anchored to the whole string.
    match id.rsplit_once('-') {
        Some((prefix, suffix)) => {
            !prefix.is_empty()
                && suffix.len() == 16
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        }
        None => false,
    }
}

fn random_hex16() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
