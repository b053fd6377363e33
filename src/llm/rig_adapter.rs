//! Adapter from a rig `CompletionModel` to `LlmProvider`.

use async_trait::async_trait;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::{AssistantContent, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role,
};

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
    /// Extra request fields sent when `json_output` is set.
    json_params: Option<serde_json::Value>,
}

impl<M> RigAdapter<M>
where
    M: CompletionModel,
{
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
            json_params: None,
        }
    }

    pub fn with_json_params(mut self, params: serde_json::Value) -> Self {
        self.json_params = Some(params);
        self
    }

    fn map_error(&self, err: CompletionError) -> LlmError {
        let provider = self.provider.to_string();
        match err {
            CompletionError::ResponseError(reason) => LlmError::InvalidResponse { provider, reason },
            CompletionError::JsonError(e) => LlmError::InvalidResponse {
                provider,
                reason: e.to_string(),
            },
            other => {
                let reason = other.to_string();
                if reason.contains("401") || reason.to_ascii_lowercase().contains("unauthorized") {
                    LlmError::AuthFailed { provider }
                } else {
                    LlmError::RequestFailed { provider, reason }
                }
            }
        }
    }
}

/// Prompt split the way rig expects it.
#[derive(Debug)]
pub(crate) struct RigPrompt {
    pub preamble: Option<String>,
    pub history: Vec<Message>,
    pub prompt: Message,
}

/// System messages join into the preamble; the last turn becomes the prompt.
pub(crate) fn split_messages(messages: Vec<ChatMessage>) -> Option<RigPrompt> {
    let mut system = Vec::new();
    let mut history = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system.push(message.content),
            Role::User => history.push(Message::user(message.content)),
            Role::Assistant => history.push(Message::assistant(message.content)),
        }
    }
    let prompt = history.pop()?;
    Some(RigPrompt {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history,
        prompt,
    })
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Clone + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let split = split_messages(request.messages).ok_or_else(|| LlmError::RequestFailed {
            provider: self.provider.to_string(),
            reason: "no user message to send".to_string(),
        })?;

        let mut builder = self
            .model
            .completion_request(split.prompt)
            .messages(split.history);
        if let Some(preamble) = split.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        if request.json_output {
            if let Some(params) = &self.json_params {
                builder = builder.additional_params(params.clone());
            }
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();
        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "no text in completion".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
        })
    }
}
