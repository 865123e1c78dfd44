//! Provider contract: text completion, structured function-calling, and
//! embeddings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use operon_types::EngineResult;

/// Maximum allowed prompt length, in bytes.
pub const MAX_PROMPT_LENGTH: usize = 32_768;

/// A completion request with validated construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Prompt text.
    pub prompt: String,
    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature in `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    /// Create a request, refusing empty or oversized prompts.
    pub fn new(prompt: impl Into<String>) -> Result<Self, String> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err("prompt cannot be empty".to_string());
        }
        if prompt.len() > MAX_PROMPT_LENGTH {
            return Err(format!(
                "prompt too long: {} > {} bytes",
                prompt.len(),
                MAX_PROMPT_LENGTH
            ));
        }
        Ok(Self { prompt, max_tokens: None, temperature: None })
    }

    /// Cap the generated tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature, clamped to `0.0..=1.0`.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Total tokens billed.
    pub total_tokens: u32,
}

/// A completion response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated content.
    pub content: String,
    /// Token usage.
    #[serde(default)]
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// Response carrying only text, with zeroed usage. Handy in tests and
    /// for providers that do not report usage.
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), usage: TokenUsage::default() }
    }
}

/// A named tool exposed to the provider's function-calling mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name the model selects by.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON-schema payload describing the arguments.
    pub parameters: Value,
}

/// Tool-selection mode for a function-calling round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model may pick any of the offered tools or answer in text.
    Auto,
    /// The model must call the named tool.
    Forced(String),
    /// No tools: second-turn text synthesis from tool outputs.
    None,
}

/// One tool invocation the model produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Selected tool name.
    pub name: String,
    /// Arguments conforming to the tool's schema.
    pub arguments: Value,
}

/// Result of a function-calling round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    /// Tool calls the model made, in order. Empty in no-tools mode.
    #[serde(default)]
    pub calls: Vec<ToolCall>,
    /// Free text the model produced, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Token usage.
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Embedding task type, forwarded to providers that optimise query and
/// document vectors separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmbeddingTaskType {
    /// Embedding a query to search with.
    RetrievalQuery,
    /// Embedding a document to be found.
    RetrievalDocument,
}

/// Contract every language-model provider implements.
///
/// Providers classify their own failures into the engine taxonomy: quota
/// signals map to `UpstreamQuota`, outages to `UpstreamUnavailable`, and
/// anything else to `UpstreamError`. The gateway and orchestrator rely on
/// this classification to decide repair eligibility.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Plain text completion.
    async fn complete(&self, request: &CompletionRequest) -> EngineResult<CompletionResponse>;

    /// Structured function-calling round.
    async fn complete_with_tools(
        &self,
        request: &CompletionRequest,
        tools: &[ToolSpec],
        choice: ToolChoice,
    ) -> EngineResult<ToolResponse>;

    /// Dense embedding of `text`.
    async fn embed(&self, text: &str, task_type: EmbeddingTaskType) -> EngineResult<Vec<f32>>;

    /// Provider name for logging and response metadata.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_validate_on_construction() {
        assert!(CompletionRequest::new("   ").is_err());
        assert!(CompletionRequest::new("a".repeat(MAX_PROMPT_LENGTH + 1)).is_err());
        let req = CompletionRequest::new("fine").unwrap().with_temperature(7.0);
        assert_eq!(req.temperature, Some(1.0));
    }

    #[test]
    fn tool_choice_serialises_tagged() {
        let forced = serde_json::to_string(&ToolChoice::Forced("pick_template".into())).unwrap();
        assert!(forced.contains("forced"));
        let auto: ToolChoice = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, ToolChoice::Auto);
    }
}
