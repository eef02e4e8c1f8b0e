//! LLM client module.
//!
//! Two layers:
//! - [`LlmClient`]: a chat-completion transport (OpenAI-compatible HTTP in
//!   production).
//! - [`TextGenerator`]: the prompt-in, text-out contract pipeline stages use.
//!   [`ChatGenerator`] adapts any `LlmClient` to it.

mod error;
mod openai;

pub use error::{classify_http_status, GenerationError, LlmError, LlmErrorKind, RetryConfig};
pub use openai::{OpenAiCompatClient, DEFAULT_BASE_URL};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Response from a chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Optional parameters for chat completions.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Top-p nucleus sampling.
    pub top_p: Option<f64>,
    /// Maximum output tokens to generate.
    pub max_tokens: Option<u64>,
    /// Ask the provider for a JSON object response.
    pub json_response: bool,
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one chat completion request. Implementations do not retry.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError>;
}

/// Prompt-in, text-out generation used by the pipeline stages.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Complete `prompt`, optionally with extra grounding `context`.
    async fn complete(&self, prompt: &str, context: Option<&str>)
        -> Result<String, GenerationError>;
}

pub type SharedGenerator = Arc<dyn TextGenerator>;

/// Adapts a chat-completion client to [`TextGenerator`].
pub struct ChatGenerator {
    client: Arc<dyn LlmClient>,
    model: String,
    options: ChatOptions,
    system_prompt: String,
}

impl ChatGenerator {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>, options: ChatOptions) -> Self {
        Self {
            client,
            model: model.into(),
            options,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn messages(&self, prompt: &str, context: Option<&str>) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            messages.push(ChatMessage::user(format!(
                "Reference material:\n\n{}",
                context
            )));
        }
        messages.push(ChatMessage::user(prompt));
        messages
    }
}

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a professional writer producing long, well-structured documents. \
     Follow the instructions exactly and answer only with the requested output.";

#[async_trait]
impl TextGenerator for ChatGenerator {
    async fn complete(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<String, GenerationError> {
        let messages = self.messages(prompt, context);
        let response = self
            .client
            .chat_completion(&self.model, &messages, &self.options)
            .await?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                "Completion used {} tokens ({} prompt, {} completion)",
                usage.total_tokens,
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }
        if response.finish_reason.as_deref() == Some("length") {
            tracing::warn!("Completion truncated at max_tokens for model {}", self.model);
        }

        match response.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(GenerationError::Content(
                "model returned empty content".to_string(),
            )),
        }
    }
}
