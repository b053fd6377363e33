//! LLM integration for the reply classifier.
//!
//! Supports:
//! - **Ollama**: local models through rig's Ollama provider
//! - **OpenAI**: any OpenAI-compatible chat-completions endpoint
//!
//! Both are rig completion models wrapped in `RigAdapter`.

pub mod provider;
pub mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::str::FromStr;
use std::sync::Arc;

use rig::client::{CompletionClient, Nothing};
use rig::providers::{ollama, openai};
use secrecy::{ExposeSecret, SecretString};

use crate::error::LlmError;

/// Default local Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default OpenAI endpoint.
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Ollama,
    OpenAi,
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(LlmBackend::Ollama),
            "openai" | "open_ai" | "openai-compatible" => Ok(LlmBackend::OpenAi),
            other => Err(format!("unknown LLM backend '{other}' (expected ollama|openai)")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub model: String,
    /// Overrides the backend's default endpoint.
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Ollama => create_ollama_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_ollama_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let url = config.base_url.as_deref().unwrap_or(DEFAULT_OLLAMA_URL);
    let client = <ollama::Client>::builder()
        .api_key(Nothing)
        .base_url(url)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "ollama".to_string(),
            reason: format!("Failed to create Ollama client: {e}"),
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Ollama at {} (model: {})", url, config.model);
    Ok(Arc::new(
        RigAdapter::new(model, &config.model, "ollama")
            .with_json_params(serde_json::json!({ "format": "json" })),
    ))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let api_key = config.api_key.as_ref().ok_or_else(|| LlmError::AuthFailed {
        provider: "openai".to_string(),
    })?;
    let url = config.base_url.as_deref().unwrap_or(DEFAULT_OPENAI_URL);

    let client = <openai::Client>::builder()
        .api_key(api_key.expose_secret())
        .base_url(url)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "openai".to_string(),
            reason: format!("Failed to create OpenAI client: {e}"),
        })?
        .completions_api();

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI-compatible API at {} (model: {})", url, config.model);
    Ok(Arc::new(
        RigAdapter::new(model, &config.model, "openai").with_json_params(
            serde_json::json!({ "response_format": { "type": "json_object" } }),
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_ollama_provider_without_key() {
        let config = LlmConfig {
            backend: LlmBackend::Ollama,
            model: "qwen2:72b-instruct-q4_0".to_string(),
            base_url: None,
            api_key: None,
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "qwen2:72b-instruct-q4_0");
    }

    #[test]
    fn test_create_openai_provider() {
        let config = LlmConfig {
            backend: LlmBackend::OpenAi,
            model: "gpt-4o".to_string(),
            base_url: Some("http://localhost:8000".to_string()),
            api_key: Some(SecretString::from("sk-test")),
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "gpt-4o");
    }

    #[test]
    fn test_openai_requires_key() {
        let config = LlmConfig {
            backend: LlmBackend::OpenAi,
            model: "gpt-4o".to_string(),
            base_url: None,
            api_key: None,
        };
        assert!(matches!(
            create_provider(&config),
            Err(LlmError::AuthFailed { .. })
        ));
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("Ollama".parse::<LlmBackend>(), Ok(LlmBackend::Ollama));
        assert_eq!("openai".parse::<LlmBackend>(), Ok(LlmBackend::OpenAi));
        assert!("anthropic".parse::<LlmBackend>().is_err());
    }
}
