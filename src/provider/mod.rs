//! # Provider Abstraction Layer
//!
//! Trait and implementations for LLM backends used by `llm` actions.
//!
//! All providers implement [`Provider`]; the engine only sees the trait, so
//! workflows run identically against a real backend or the [`MockProvider`]
//! used in tests and the CLI's offline mode. Providers may stream: the
//! default `execute_stream` wraps the blocking `execute` in a single-chunk
//! stream, and streaming backends override it.

mod mock;

pub use mock::MockProvider;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::step::StepChunk;

// ============================================================================
// TOKEN ESTIMATION
// ============================================================================

/// Average characters per token for mixed content (prose + code)
const CHARS_PER_TOKEN_MIXED: f32 = 3.0;

/// Token usage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    /// Estimate usage when the backend does not report real counts
    pub fn estimate(prompt_len: usize, response_len: usize) -> Self {
        let prompt_tokens = (prompt_len as f32 / CHARS_PER_TOKEN_MIXED).ceil() as u32;
        let completion_tokens = (response_len as f32 / CHARS_PER_TOKEN_MIXED).ceil() as u32;
        Self::new(prompt_tokens, completion_tokens)
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// One message of conversation history
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Request to execute a prompt
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: String,
    pub history: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Client-side tool exposed to the model
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            system_prompt: None,
            history: vec![],
            tools: vec![],
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Aggregated response from a prompt execution
#[derive(Debug, Clone)]
pub struct PromptResponse {
    pub content: String,
    pub success: bool,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

impl PromptResponse {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            usage: TokenUsage::default(),
            stop_reason: Some("end_turn".to_string()),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            content: error.into(),
            success: false,
            usage: TokenUsage::default(),
            stop_reason: Some("error".to_string()),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Core trait all LLM providers implement. The engine drives providers
/// exclusively through this interface.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, e.g. "mock"
    fn name(&self) -> &str;

    /// Execute a prompt and return the aggregated response
    async fn execute(&self, request: PromptRequest) -> Result<PromptResponse>;

    /// Execute a prompt as a chunk stream. The default implementation runs
    /// `execute` and emits its content as one text chunk.
    async fn execute_stream(
        &self,
        request: PromptRequest,
    ) -> Result<BoxStream<'static, Result<StepChunk, String>>> {
        let response = self.execute(request).await?;
        let chunk = if response.success {
            Ok(StepChunk::Text { delta: response.content })
        } else {
            Err(response.content)
        };
        Ok(Box::pin(futures::stream::iter(vec![chunk])))
    }

    /// Whether this provider supports tool calling
    fn supports_tools(&self) -> bool {
        false
    }

    /// Whether the provider is usable right now (keys present, etc.)
    fn is_available(&self) -> bool {
        true
    }
}

/// Create a provider instance by name
pub fn create_provider(name: &str) -> Result<std::sync::Arc<dyn Provider>> {
    match name.to_lowercase().as_str() {
        "mock" => Ok(std::sync::Arc::new(MockProvider::new())),
        _ => anyhow::bail!("Unknown provider: '{}'. Available: mock", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_request_builder() {
        let req = PromptRequest::new("Hello", "model-x")
            .with_system_prompt("Be helpful")
            .with_history(vec![ChatMessage::user("hi")]);
        assert_eq!(req.prompt, "Hello");
        assert_eq!(req.model, "model-x");
        assert_eq!(req.system_prompt.as_deref(), Some("Be helpful"));
        assert_eq!(req.history.len(), 1);
    }

    #[test]
    fn token_usage_estimate() {
        let usage = TokenUsage::estimate(300, 150);
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 50);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn create_provider_by_name() {
        assert!(create_provider("mock").is_ok());
        assert!(create_provider("nope").is_err());
    }

    #[tokio::test]
    async fn default_stream_wraps_execute() {
        let provider = MockProvider::new().with_default("streamed!");
        let stream = provider
            .execute_stream(PromptRequest::new("p", "m"))
            .await
            .expect("stream");
        let chunks: Vec<_> = futures::StreamExt::collect::<Vec<_>>(stream).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            &chunks[0],
            Ok(StepChunk::Text { delta }) if delta == "streamed!"
        ));
    }
}
