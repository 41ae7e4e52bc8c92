//! OpenAI-compatible chat-completions runtime.
//!
//! A concrete [`LlmRuntime`] over the chat completions API shape shared by
//! the supported providers. Conversation history is persisted as one JSON
//! line per message under the session directory, so a session can be
//! resumed after a process restart.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::LlmError;
use crate::llm::{ContextUsage, LlmRuntime, LlmSession, SessionOptions};
use crate::tools::{self, Tool, ToolContext};

/// Upper bound on tool-call round trips within a single prompt.
const MAX_TOOL_ROUNDS: usize = 8;

/// Rough context window used for usage estimation, in tokens.
const ASSUMED_CONTEXT_TOKENS: usize = 128_000;

/// File name for persisted history inside the session directory.
const HISTORY_FILE: &str = "history.jsonl";

/// Chat completions base URL for a provider.
fn base_url(provider: &str) -> String {
    match provider {
        "openai" => "https://api.openai.com/v1".to_string(),
        "anthropic" => "https://api.anthropic.com/v1".to_string(),
        "gemini" => "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
        "groq" => "https://api.groq.com/openai/v1".to_string(),
        "cerebras" => "https://api.cerebras.ai/v1".to_string(),
        "xai" => "https://api.x.ai/v1".to_string(),
        "openrouter" => "https://openrouter.ai/api/v1".to_string(),
        "mistral" => "https://api.mistral.ai/v1".to_string(),
        other => format!("https://api.{}.com/v1", other),
    }
}

/// One message in the wire/history format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

/// Runtime speaking the OpenAI-compatible chat completions API.
pub struct ChatRuntime {
    provider: String,
    client: Client,
}

impl ChatRuntime {
    pub fn new(provider: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            provider: provider.into(),
            client,
        }
    }
}

#[async_trait]
impl LlmRuntime for ChatRuntime {
    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<Arc<dyn LlmSession>, LlmError> {
        let api_key = options
            .auth
            .get(&self.provider)
            .cloned()
            .ok_or_else(|| LlmError::MissingApiKey {
                provider: self.provider.clone(),
            })?;

        tokio::fs::create_dir_all(&options.session_dir).await?;
        let history_path = options.session_dir.join(HISTORY_FILE);

        let mut history = Vec::new();
        if options.resume {
            history = load_history(&history_path).await;
            if !history.is_empty() {
                tracing::debug!(
                    messages = history.len(),
                    path = %history_path.display(),
                    "Resumed session history"
                );
            }
        }

        Ok(Arc::new(ChatSession {
            provider: self.provider.clone(),
            model: options.model,
            client: self.client.clone(),
            api_key,
            history_path,
            custom_tools: options.custom_tools,
            tool_ctx: ToolContext {
                is_subagent: options.is_subagent,
                session_id: None,
            },
            state: Mutex::new(SessionState {
                history,
                last_assistant_text: None,
            }),
        }))
    }
}

struct SessionState {
    history: Vec<WireMessage>,
    last_assistant_text: Option<String>,
}

/// A live conversation against a chat completions endpoint.
pub struct ChatSession {
    provider: String,
    model: String,
    client: Client,
    api_key: secrecy::SecretString,
    history_path: PathBuf,
    custom_tools: Vec<Arc<dyn Tool>>,
    tool_ctx: ToolContext,
    state: Mutex<SessionState>,
}

impl ChatSession {
    fn tool_schemas(&self) -> Option<serde_json::Value> {
        if self.custom_tools.is_empty() {
            return None;
        }
        let entries: Vec<serde_json::Value> = self
            .custom_tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters_schema(),
                    }
                })
            })
            .collect();
        Some(serde_json::Value::Array(entries))
    }

    async fn complete(&self, messages: &[WireMessage]) -> Result<ChoiceMessage, LlmError> {
        let url = format!("{}/chat/completions", base_url(&self.provider));
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            tools: self.tool_schemas(),
        };

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Request {
                provider: self.provider.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LlmError::Request {
                provider: self.provider.clone(),
                message: format!("HTTP {}: {}", status, body),
            });
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::BadResponse {
                provider: self.provider.clone(),
                message: format!("JSON parse error: {}", e),
            })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::BadResponse {
                provider: self.provider.clone(),
                message: "no choices in response".to_string(),
            })
    }

    async fn append_history(&self, new_messages: &[WireMessage]) {
        // History is best-effort: a failed append degrades resume, not the turn.
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .await
        {
            Ok(mut file) => {
                let mut buffer = String::new();
                for message in new_messages {
                    if let Ok(line) = serde_json::to_string(message) {
                        buffer.push_str(&line);
                        buffer.push('\n');
                    }
                }
                if let Err(e) = file.write_all(buffer.as_bytes()).await {
                    tracing::warn!("Failed to persist session history: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.history_path.display(),
                    "Failed to open session history: {}", e
                );
            }
        }
    }
}

async fn load_history(path: &PathBuf) -> Vec<WireMessage> {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[async_trait]
impl LlmSession for ChatSession {
    async fn prompt(&self, text: &str) -> Result<(), LlmError> {
        let mut state = self.state.lock().await;
        let base_len = state.history.len();
        state.history.push(WireMessage::user(text));

        for _ in 0..MAX_TOOL_ROUNDS {
            let reply = self.complete(&state.history).await?;

            let tool_calls = reply.tool_calls.clone().unwrap_or_default();
            state.history.push(WireMessage {
                role: "assistant".to_string(),
                content: reply.content.clone(),
                tool_calls: reply.tool_calls,
                tool_call_id: None,
            });

            if tool_calls.is_empty() {
                state.last_assistant_text = reply.content;
                let new = state.history[base_len..].to_vec();
                drop(state);
                self.append_history(&new).await;
                return Ok(());
            }

            for call in tool_calls {
                let params: serde_json::Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or_default();
                let result =
                    tools::dispatch(&self.custom_tools, &call.function.name, params, &self.tool_ctx)
                        .await;
                let rendered = result.to_string();
                state
                    .history
                    .push(WireMessage::tool_result(call.id, rendered));
            }
        }

        Err(LlmError::BadResponse {
            provider: self.provider.clone(),
            message: format!("tool-call loop exceeded {} rounds", MAX_TOOL_ROUNDS),
        })
    }

    async fn last_assistant_text(&self) -> Option<String> {
        self.state.lock().await.last_assistant_text.clone()
    }

    async fn context_usage(&self) -> Option<ContextUsage> {
        let state = self.state.lock().await;
        let chars: usize = state
            .history
            .iter()
            .map(|m| m.content.as_deref().map_or(0, str::len))
            .sum();
        // Crude chars-per-token estimate; good enough for a flush hint.
        let tokens = chars / 4;
        Some(ContextUsage {
            percent: (tokens as f64 / ASSUMED_CONTEXT_TOKENS as f64).min(1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_for_known_providers() {
        assert_eq!(base_url("openai"), "https://api.openai.com/v1");
        assert_eq!(base_url("groq"), "https://api.groq.com/openai/v1");
        assert_eq!(base_url("openrouter"), "https://openrouter.ai/api/v1");
    }

    #[tokio::test]
    async fn test_history_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE);

        let messages = vec![
            WireMessage::user("hello"),
            WireMessage {
                role: "assistant".to_string(),
                content: Some("hi".to_string()),
                tool_calls: None,
                tool_call_id: None,
            },
        ];
        let mut encoded = String::new();
        for m in &messages {
            encoded.push_str(&serde_json::to_string(m).unwrap());
            encoded.push('\n');
        }
        // A malformed line in the middle is skipped on load.
        encoded.push_str("{not json}\n");
        tokio::fs::write(&path, encoded).await.unwrap();

        let loaded = load_history(&path).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].role, "user");
        assert_eq!(loaded[1].content.as_deref(), Some("hi"));
    }
}
