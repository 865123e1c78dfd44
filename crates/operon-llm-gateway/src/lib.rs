#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-llm-gateway** – Secure LLM and embedding provider gateway for
//! the Operon engine.
//!
//! The engine never talks to a language-model provider directly. Every
//! completion, function-calling round, and embedding request goes through
//! the [`LlmGateway`], which adds:
//!
//! - **Rate limiting**: a per-caller quota so one noisy task cannot starve
//!   the rest of the engine.
//! - **Prompt sanitization**: outbound prompts are scanned for injection
//!   attempts and credential material before they leave the process.
//! - **Response validation**: oversized responses are refused; embedding
//!   vectors are checked for the contracted dimensionality and finiteness.
//! - **Usage metrics**: request, failure, and token counters with a rolling
//!   latency average.
//!
//! Concrete providers implement [`LlmProvider`] and are injected at
//! construction; the engine core stays free of HTTP and API-key handling.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use governor::clock::DefaultClock;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use operon_types::{EngineError, EngineResult, EMBEDDING_DIM};

pub mod provider;
pub mod sanitizer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use provider::{
    CompletionRequest, CompletionResponse, EmbeddingTaskType, LlmProvider, TokenUsage, ToolCall,
    ToolChoice, ToolResponse, ToolSpec,
};
pub use sanitizer::PromptSanitizer;

/// Default per-caller rate limit, requests per minute.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;

/// Maximum allowed response length, in bytes.
pub const MAX_RESPONSE_LENGTH: usize = 1_048_576;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Usage metrics collected by the gateway.
#[derive(Debug, Default, Clone)]
pub struct GatewayMetrics {
    /// Total requests processed (completions, tool rounds, embeddings).
    pub total_requests: u64,
    /// Requests that returned successfully.
    pub successful_responses: u64,
    /// Requests that failed or were refused.
    pub failed_requests: u64,
    /// Total tokens reported by the provider.
    pub total_tokens: u64,
    /// Rolling average provider latency in milliseconds.
    pub avg_response_time_ms: f64,
}

/// Secure gateway in front of an [`LlmProvider`].
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    rate_limiter: KeyedLimiter,
    sanitizer: PromptSanitizer,
    metrics: Arc<RwLock<GatewayMetrics>>,
}

impl LlmGateway {
    /// Wrap a provider with the default rate limit.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self::with_rate_limit(provider, DEFAULT_RATE_LIMIT_PER_MINUTE)
    }

    /// Wrap a provider with a custom per-caller requests-per-minute quota.
    pub fn with_rate_limit(provider: Arc<dyn LlmProvider>, per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(per_minute.max(1)).expect("clamped above zero");
        Self {
            provider,
            rate_limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
            sanitizer: PromptSanitizer::new(),
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
        }
    }

    /// Plain text completion on behalf of `caller`.
    pub async fn complete(
        &self,
        caller: &str,
        request: CompletionRequest,
    ) -> EngineResult<CompletionResponse> {
        self.check_rate(caller)?;
        let request = self.sanitize(request)?;

        let start = Instant::now();
        let result = self.provider.complete(&request).await;
        self.settle(start, result, |r| {
            if r.content.len() > MAX_RESPONSE_LENGTH {
                Err(EngineError::UpstreamError {
                    message: format!(
                        "response too long: {} > {} bytes",
                        r.content.len(),
                        MAX_RESPONSE_LENGTH
                    ),
                    step: None,
                })
            } else {
                Ok(r)
            }
        })
        .await
    }

    /// Function-calling round on behalf of `caller`.
    ///
    /// `choice` selects between forced tool selection and a no-tools text
    /// turn, matching the two provider modes the engine needs.
    pub async fn complete_with_tools(
        &self,
        caller: &str,
        request: CompletionRequest,
        tools: &[ToolSpec],
        choice: ToolChoice,
    ) -> EngineResult<ToolResponse> {
        self.check_rate(caller)?;
        let request = self.sanitize(request)?;

        let start = Instant::now();
        let result = self.provider.complete_with_tools(&request, tools, choice).await;
        self.settle(start, result, Ok).await
    }

    /// Embed `text` and validate the vector against the engine contract.
    pub async fn embed(
        &self,
        caller: &str,
        text: &str,
        task_type: EmbeddingTaskType,
    ) -> EngineResult<Vec<f32>> {
        self.check_rate(caller)?;

        let start = Instant::now();
        let result = self.provider.embed(text, task_type).await;
        self.settle(start, result, |vector| {
            if vector.len() != EMBEDDING_DIM {
                return Err(EngineError::InternalInvariant {
                    message: format!(
                        "embedding provider returned {} dimensions, contract is {}",
                        vector.len(),
                        EMBEDDING_DIM
                    ),
                });
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::InternalInvariant {
                    message: "embedding provider returned non-finite components".to_string(),
                });
            }
            Ok(vector)
        })
        .await
    }

    /// Snapshot of current metrics.
    pub async fn metrics(&self) -> GatewayMetrics {
        self.metrics.read().await.clone()
    }

    fn check_rate(&self, caller: &str) -> EngineResult<()> {
        if self.rate_limiter.check_key(&caller.to_string()).is_err() {
            warn!(caller, "gateway rate limit exceeded");
            return Err(EngineError::UpstreamQuota {
                message: format!("gateway rate limit exceeded for {caller}"),
            });
        }
        Ok(())
    }

    fn sanitize(&self, request: CompletionRequest) -> EngineResult<CompletionRequest> {
        self.sanitizer.sanitize(request).map_err(|reason| {
            warn!(%reason, "prompt refused by sanitizer");
            EngineError::ScriptInvalid { reason }
        })
    }

    async fn settle<T>(
        &self,
        start: Instant,
        result: EngineResult<T>,
        validate: impl FnOnce(T) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let elapsed_ms = start.elapsed().as_millis() as f64;
        let validated = result.and_then(validate);
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        match &validated {
            Ok(_) => {
                metrics.successful_responses += 1;
                let n = metrics.successful_responses as f64;
                metrics.avg_response_time_ms =
                    (metrics.avg_response_time_ms * (n - 1.0) + elapsed_ms) / n;
            }
            Err(e) => {
                debug!(error = %e, "gateway request failed");
                metrics.failed_requests += 1;
            }
        }
        Ok(validated?)
    }

    /// Record token usage reported out-of-band by a provider response.
    pub async fn record_tokens(&self, usage: &TokenUsage) {
        let mut metrics = self.metrics.write().await;
        metrics.total_tokens += u64::from(usage.total_tokens);
    }
}
