//! Configuration for the supervisor and the per-agent orchestrator.
//!
//! Options resolve in the usual order: explicit value, then environment
//! variable, then default. API keys are never stored in configuration
//! files; they come from the caller or from the provider's environment
//! variable and live only in the in-memory auth store.

use std::path::PathBuf;

use secrecy::SecretString;

/// Default provider when none is configured.
pub const DEFAULT_PROVIDER: &str = "openai";

/// Default model when none is configured.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Default data directory, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = ".tinycrab";

/// First port the supervisor tries when allocating agent ports.
pub const DEFAULT_START_PORT: u16 = 9000;

/// Where agent processes run.
///
/// Only `Local` is implemented; the other modes are recognized so that
/// configuration written for a fuller deployment parses cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Local,
    Docker,
    Remote,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Remote => "remote",
        }
    }

    /// Parse a mode string; unknown values fall back to `Local`.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "docker" => Self::Docker,
            "remote" => Self::Remote,
            _ => Self::Local,
        }
    }
}

/// Top-level options for a supervisor instance.
#[derive(Debug, Clone)]
pub struct TinycrabOptions {
    /// API key for the configured provider. Falls back to the provider's
    /// environment variable when absent.
    pub api_key: Option<SecretString>,
    /// LLM provider name (e.g. `openai`, `anthropic`, `groq`).
    pub provider: String,
    /// Model identifier, passed through to the runtime.
    pub model: String,
    /// Where agent processes run. Only `local` is implemented.
    pub mode: Mode,
    /// Root data directory holding `agents/` and `cron.json`.
    pub data_dir: PathBuf,
    /// Remote supervisor URL (`remote` mode only).
    pub url: Option<String>,
    /// Container image (`docker` mode only).
    pub image: Option<String>,
}

impl Default for TinycrabOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            mode: Mode::Local,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            url: None,
            image: None,
        }
    }
}

impl TinycrabOptions {
    /// Build options from `AGENT_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(provider) = std::env::var("AGENT_PROVIDER") {
            if !provider.trim().is_empty() {
                options.provider = provider.trim().to_ascii_lowercase();
            }
        }
        if let Ok(model) = std::env::var("AGENT_MODEL") {
            if !model.trim().is_empty() {
                options.model = model.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("AGENT_DATA_DIR") {
            if !dir.trim().is_empty() {
                options.data_dir = PathBuf::from(dir.trim());
            }
        }
        options
    }

    /// Set the provider.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Directory holding per-agent state.
    pub fn agents_dir(&self) -> PathBuf {
        self.data_dir.join("agents")
    }

    /// Path of the cron store used by the single orchestrator.
    pub fn cron_store_path(&self) -> PathBuf {
        self.data_dir.join("cron.json")
    }
}

/// The environment variable carrying the API key for a provider
/// (e.g. `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `GROQ_API_KEY`).
pub fn provider_key_env_var(provider: &str) -> String {
    let mut name: String = provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    name.push_str("_API_KEY");
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TinycrabOptions::default();
        assert_eq!(options.provider, "openai");
        assert_eq!(options.model, "gpt-4o");
        assert_eq!(options.mode, Mode::Local);
        assert_eq!(options.data_dir, PathBuf::from(".tinycrab"));
    }

    #[test]
    fn test_provider_key_env_var() {
        assert_eq!(provider_key_env_var("openai"), "OPENAI_API_KEY");
        assert_eq!(provider_key_env_var("anthropic"), "ANTHROPIC_API_KEY");
        assert_eq!(provider_key_env_var("openrouter"), "OPENROUTER_API_KEY");
        assert_eq!(provider_key_env_var("x.ai"), "X_AI_API_KEY");
    }

    #[test]
    fn test_mode_parse_unknown_falls_back_to_local() {
        assert_eq!(Mode::parse("docker"), Mode::Docker);
        assert_eq!(Mode::parse("REMOTE"), Mode::Remote);
        assert_eq!(Mode::parse("bogus"), Mode::Local);
    }
}
