//! Scripted provider for tests.
//!
//! Completions and tool rounds are served from queues pushed by the test;
//! embeddings come from an exact-text table with a deterministic hashed
//! fallback so any text embeds to a stable, contract-sized vector.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use operon_types::{EngineError, EngineResult, EMBEDDING_DIM};

use crate::provider::{
    CompletionRequest, CompletionResponse, EmbeddingTaskType, LlmProvider, ToolChoice,
    ToolResponse, ToolSpec,
};

/// A provider whose responses are scripted by the test.
#[derive(Default)]
pub struct ScriptedProvider {
    completions: Mutex<VecDeque<EngineResult<CompletionResponse>>>,
    tool_responses: Mutex<VecDeque<EngineResult<ToolResponse>>>,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
    prompts_seen: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// Create a provider with empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next completion result.
    pub fn push_completion(&self, result: EngineResult<CompletionResponse>) {
        self.completions.lock().push_back(result);
    }

    /// Queue the next tool-round result.
    pub fn push_tool_response(&self, result: EngineResult<ToolResponse>) {
        self.tool_responses.lock().push_back(result);
    }

    /// Pin the embedding returned for an exact text.
    pub fn set_embedding(&self, text: &str, vector: Vec<f32>) {
        self.embeddings.lock().insert(text.to_string(), vector);
    }

    /// Prompts the provider has been asked to complete, in order.
    pub fn prompts_seen(&self) -> Vec<String> {
        self.prompts_seen.lock().clone()
    }

    /// A contract-sized unit vector with `1.0` at `index`. Useful for
    /// constructing controlled similarity orderings in tests.
    pub fn one_hot(index: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[index % EMBEDDING_DIM] = 1.0;
        v
    }

    /// Deterministic contract-sized embedding of arbitrary text.
    pub fn hashed_embedding(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        let mut state: u64 = 0xcbf2_9ce4_8422_2325;
        for (i, byte) in text.bytes().enumerate() {
            state = state.wrapping_mul(0x1000_0000_01b3) ^ u64::from(byte);
            let slot = (state as usize) % EMBEDDING_DIM;
            v[slot] += if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        v
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> EngineResult<CompletionResponse> {
        self.prompts_seen.lock().push(request.prompt.clone());
        self.completions.lock().pop_front().unwrap_or_else(|| {
            Err(EngineError::UpstreamError {
                message: "scripted provider has no queued completion".to_string(),
                step: None,
            })
        })
    }

    async fn complete_with_tools(
        &self,
        request: &CompletionRequest,
        _tools: &[ToolSpec],
        _choice: ToolChoice,
    ) -> EngineResult<ToolResponse> {
        self.prompts_seen.lock().push(request.prompt.clone());
        self.tool_responses.lock().pop_front().unwrap_or_else(|| {
            Err(EngineError::UpstreamError {
                message: "scripted provider has no queued tool response".to_string(),
                step: None,
            })
        })
    }

    async fn embed(&self, text: &str, _task_type: EmbeddingTaskType) -> EngineResult<Vec<f32>> {
        if let Some(vector) = self.embeddings.lock().get(text) {
            return Ok(vector.clone());
        }
        Ok(Self::hashed_embedding(text))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_queues_serve_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_completion(Ok(CompletionResponse::text("one")));
        provider.push_completion(Ok(CompletionResponse::text("two")));

        let req = CompletionRequest::new("x y z").unwrap();
        assert_eq!(provider.complete(&req).await.unwrap().content, "one");
        assert_eq!(provider.complete(&req).await.unwrap().content, "two");
        assert!(provider.complete(&req).await.is_err());
    }

    #[tokio::test]
    async fn hashed_embeddings_are_stable() {
        let a = ScriptedProvider::hashed_embedding("same text");
        let b = ScriptedProvider::hashed_embedding("same text");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
    }
}
