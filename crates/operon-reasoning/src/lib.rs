#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-reasoning** – Distilled lessons with vector retrieval.
//!
//! Reasoning memory is the engine's feedback loop: after every terminal
//! execution, repair attempt, and human template edit, an LLM distils a
//! handful of lessons which are validated, embedded, and indexed. The
//! repair loop retrieves them by semantic similarity against the failure
//! it is trying to fix, and attribution counters track whether retrieved
//! lessons actually helped.
//!
//! This component is a *sink*: the orchestrator hands it trajectories and
//! repair contexts, and it never calls back into orchestration. Validation
//! failures here are warnings, never task failures.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use operon_llm_gateway::{CompletionRequest, EmbeddingTaskType, LlmGateway};
use operon_sandbox::ScriptPolicy;
use operon_store_core::{DocumentStore, FieldOp, Filter, NearestQuery, Query, VectorIndex};
use operon_types::{
    EngineError, EngineResult, MemoryCategory, MemorySource, MemoryStats, ReasoningMemory,
    Trajectory, UserIntent, PER_TEMPLATE_MEMORY_QUOTA,
};

pub mod candidate;
mod prompts;

pub use candidate::{parse_candidate_array, validate_candidate, Candidate};

/// Collection memories are stored in.
pub const MEMORY_COLLECTION: &str = "memories";

/// Candidate cap for task-sourced extraction.
pub const TASK_SOURCE_MAX_CANDIDATES: usize = 3;

/// Candidate cap for repair- and user-sourced extraction.
pub const EDIT_SOURCE_MAX_CANDIDATES: usize = 2;

/// Default retrieval depth for the repair loop.
pub const DEFAULT_RETRIEVAL_K: usize = 5;

/// Caller tag used against the gateway.
const GATEWAY_CALLER: &str = "reasoning";

/// Context handed in when a repair attempt is distilled.
#[derive(Debug, Clone)]
pub struct RepairExtractionContext {
    /// Template that was repaired.
    pub template_id: String,
    /// Task whose failure triggered the repair.
    pub task_id: String,
    /// Summary of the original error.
    pub error_summary: String,
    /// Script before the repair.
    pub script_before: String,
    /// Script after the repair.
    pub script_after: String,
    /// Whether the repaired retry succeeded.
    pub repair_succeeded: bool,
}

/// Context handed in when a human template edit is distilled.
#[derive(Debug, Clone)]
pub struct UserModificationContext {
    /// Edited template.
    pub template_id: String,
    /// Editing user.
    pub user_id: String,
    /// Script before the edit.
    pub script_before: String,
    /// Script after the edit.
    pub script_after: String,
}

/// Pre-filters for retrieval.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilter {
    /// Restrict to these categories (empty = all).
    pub categories: Vec<MemoryCategory>,
    /// Restrict to one template's memories.
    pub template_id: Option<String>,
}

/// The reasoning-memory service.
pub struct MemoryService {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    gateway: Arc<LlmGateway>,
    policy: Arc<ScriptPolicy>,
}

impl MemoryService {
    /// Build the service over the given capabilities.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        gateway: Arc<LlmGateway>,
        policy: Arc<ScriptPolicy>,
    ) -> Self {
        Self { store, index, gateway, policy }
    }

    //─────────────────────────────
    //  Extraction
    //─────────────────────────────

    /// Distil lessons from a successful trajectory.
    pub async fn extract_from_success(
        &self,
        trajectory: &Trajectory,
        user_intent: Option<UserIntent>,
    ) -> EngineResult<Vec<ReasoningMemory>> {
        let prompt = prompts::success_prompt(trajectory, TASK_SOURCE_MAX_CANDIDATES);
        self.extract(
            &prompt,
            TASK_SOURCE_MAX_CANDIDATES,
            MemorySource::TaskSuccess,
            Some(trajectory.template_id.clone()),
            Some(trajectory.task_id.clone()),
            user_intent,
        )
        .await
    }

    /// Distil lessons from a failed trajectory.
    pub async fn extract_from_failure(
        &self,
        trajectory: &Trajectory,
        user_intent: Option<UserIntent>,
    ) -> EngineResult<Vec<ReasoningMemory>> {
        let prompt = prompts::failure_prompt(trajectory, TASK_SOURCE_MAX_CANDIDATES);
        self.extract(
            &prompt,
            TASK_SOURCE_MAX_CANDIDATES,
            MemorySource::TaskFailure,
            Some(trajectory.template_id.clone()),
            Some(trajectory.task_id.clone()),
            user_intent,
        )
        .await
    }

    /// Distil lessons from a repair attempt, successful or not.
    pub async fn extract_from_repair(
        &self,
        ctx: &RepairExtractionContext,
    ) -> EngineResult<Vec<ReasoningMemory>> {
        let prompt = prompts::repair_prompt(ctx, EDIT_SOURCE_MAX_CANDIDATES);
        let source = if ctx.repair_succeeded {
            MemorySource::RepairSuccess
        } else {
            MemorySource::RepairFailure
        };
        self.extract(
            &prompt,
            EDIT_SOURCE_MAX_CANDIDATES,
            source,
            Some(ctx.template_id.clone()),
            Some(ctx.task_id.clone()),
            None,
        )
        .await
    }

    /// Distil lessons from a human template edit.
    pub async fn extract_from_user_modification(
        &self,
        ctx: &UserModificationContext,
    ) -> EngineResult<Vec<ReasoningMemory>> {
        let prompt = prompts::user_modification_prompt(ctx, EDIT_SOURCE_MAX_CANDIDATES);
        self.extract(
            &prompt,
            EDIT_SOURCE_MAX_CANDIDATES,
            MemorySource::UserModification,
            Some(ctx.template_id.clone()),
            None,
            None,
        )
        .await
    }

    async fn extract(
        &self,
        prompt: &str,
        max_candidates: usize,
        source: MemorySource,
        template_id: Option<String>,
        task_id: Option<String>,
        user_intent: Option<UserIntent>,
    ) -> EngineResult<Vec<ReasoningMemory>> {
        let request = CompletionRequest::new(prompt)
            .map_err(|reason| EngineError::InternalInvariant {
                message: format!("extraction prompt invalid: {reason}"),
            })?
            .with_max_tokens(1024);
        let response = self.gateway.complete(GATEWAY_CALLER, request).await?;

        let raw_candidates = match parse_candidate_array(&response.content) {
            Ok(items) => items,
            Err(reason) => {
                warn!(%reason, "extraction response unusable, no memories distilled");
                return Ok(Vec::new());
            }
        };

        let mut stored = Vec::new();
        for raw in raw_candidates.into_iter().take(max_candidates) {
            let candidate = match validate_candidate(&raw, &self.policy) {
                Ok(candidate) => candidate,
                Err(reason) => {
                    warn!(%reason, "memory candidate rejected");
                    continue;
                }
            };
            let memory = ReasoningMemory {
                memory_id: format!("mem_{}", Uuid::new_v4()),
                title: candidate.title,
                description: candidate.description,
                content: candidate.content,
                category: candidate.category,
                source,
                template_id: template_id.clone(),
                task_id: task_id.clone(),
                embedding: None,
                times_retrieved: 0,
                times_used_in_success: 0,
                times_used_in_failure: 0,
                success_rate: 0.0,
                user_intent: user_intent.clone(),
                created_at: Utc::now(),
            };
            match self.store_memory(memory).await {
                Ok(memory) => stored.push(memory),
                Err(reason) => warn!(%reason, "memory rejected at write"),
            }
        }

        if let Some(template_id) = &template_id {
            self.enforce_quota(template_id).await?;
        }

        info!(count = stored.len(), source = source.as_str(), "memories distilled");
        Ok(stored)
    }

    /// Validate, embed, persist, and index one memory.
    async fn store_memory(&self, mut memory: ReasoningMemory) -> Result<ReasoningMemory, String> {
        if memory.source.is_failure() && memory.success_rate > 0.0 {
            return Err("failure-sourced memory cannot start with a positive success rate".into());
        }

        let embedding = self
            .gateway
            .embed(GATEWAY_CALLER, &memory.embedding_text(), EmbeddingTaskType::RetrievalDocument)
            .await
            .map_err(|e| format!("embedding failed: {e}"))?;
        memory.embedding = Some(embedding.clone());

        let doc = serde_json::to_value(&memory).map_err(|e| e.to_string())?;
        self.store
            .put(MEMORY_COLLECTION, &memory.memory_id, doc)
            .await
            .map_err(|e| e.to_string())?;
        self.index
            .upsert(
                MEMORY_COLLECTION,
                &memory.memory_id,
                "embedding",
                embedding,
                json!({
                    "category": memory.category.as_str(),
                    "source": memory.source.as_str(),
                    "template_id": memory.template_id,
                }),
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(memory)
    }

    /// Evict oldest-first once a template exceeds its memory quota.
    async fn enforce_quota(&self, template_id: &str) -> EngineResult<()> {
        let rows = self
            .store
            .query(
                MEMORY_COLLECTION,
                Query::all()
                    .filter("template_id", operon_store_core::FilterOp::Eq, json!(template_id))
                    .order("created_at", operon_store_core::SortDirection::Asc),
            )
            .await
            .map_err(store_err)?;
        if rows.len() <= PER_TEMPLATE_MEMORY_QUOTA {
            return Ok(());
        }
        let excess = rows.len() - PER_TEMPLATE_MEMORY_QUOTA;
        for (id, _) in rows.into_iter().take(excess) {
            debug!(memory_id = %id, template_id, "evicting memory over quota");
            self.store.delete(MEMORY_COLLECTION, &id).await.map_err(store_err)?;
            self.index.remove(MEMORY_COLLECTION, &id).await.map_err(store_err)?;
        }
        Ok(())
    }

    //─────────────────────────────
    //  Retrieval and attribution
    //─────────────────────────────

    /// Retrieve the k most relevant memories for a query text.
    ///
    /// Every returned memory's `times_retrieved` counter is incremented.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: &RetrievalFilter,
    ) -> EngineResult<Vec<ReasoningMemory>> {
        let query_vector = self
            .gateway
            .embed(GATEWAY_CALLER, query, EmbeddingTaskType::RetrievalQuery)
            .await?;

        let mut filters: Vec<Filter> = Vec::new();
        if let Some(template_id) = &filter.template_id {
            filters.push(Filter::eq("template_id", json!(template_id)));
        }
        if filter.categories.len() == 1 {
            filters.push(Filter::eq("category", json!(filter.categories[0].as_str())));
        }

        let hits = self
            .index
            .find_nearest(
                MEMORY_COLLECTION,
                NearestQuery {
                    vector_field: "embedding".to_string(),
                    query: query_vector,
                    k: if filter.categories.len() > 1 { k * 2 } else { k },
                    filters,
                },
            )
            .await
            .map_err(store_err)?;

        let mut memories = Vec::with_capacity(k);
        for hit in hits {
            let Some(doc) = self.store.get(MEMORY_COLLECTION, &hit.doc_id).await.map_err(store_err)?
            else {
                continue;
            };
            let memory: ReasoningMemory = serde_json::from_value(doc).map_err(|e| {
                EngineError::InternalInvariant { message: format!("memory deserialisation: {e}") }
            })?;
            // Multi-category bias is applied post-ranking.
            if filter.categories.len() > 1 && !filter.categories.contains(&memory.category) {
                continue;
            }
            self.store
                .update(
                    MEMORY_COLLECTION,
                    &memory.memory_id,
                    vec![("times_retrieved".to_string(), FieldOp::Increment(1))],
                )
                .await
                .map_err(store_err)?;
            memories.push(memory);
            if memories.len() == k {
                break;
            }
        }
        Ok(memories)
    }

    /// Attribute an execution outcome to the memories that were retrieved
    /// into it and refresh their derived success rates.
    pub async fn record_outcome(&self, memory_ids: &[String], success: bool) -> EngineResult<()> {
        let counter = if success { "times_used_in_success" } else { "times_used_in_failure" };
        for id in memory_ids {
            self.store
                .update(MEMORY_COLLECTION, id, vec![(counter.to_string(), FieldOp::Increment(1))])
                .await
                .map_err(store_err)?;

            let Some(doc) = self.store.get(MEMORY_COLLECTION, id).await.map_err(store_err)? else {
                continue;
            };
            let wins = doc["times_used_in_success"].as_u64().unwrap_or(0);
            let losses = doc["times_used_in_failure"].as_u64().unwrap_or(0);
            let rate = if wins + losses == 0 { 0.0 } else { wins as f64 / (wins + losses) as f64 };
            self.store
                .update(
                    MEMORY_COLLECTION,
                    id,
                    vec![("success_rate".to_string(), FieldOp::Set(json!(rate)))],
                )
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    /// Delete a memory and its index entry.
    pub async fn delete(&self, memory_id: &str) -> EngineResult<()> {
        self.store.delete(MEMORY_COLLECTION, memory_id).await.map_err(store_err)?;
        self.index.remove(MEMORY_COLLECTION, memory_id).await.map_err(store_err)?;
        Ok(())
    }

    /// Aggregate statistics over the whole memory store.
    pub async fn get_stats(&self) -> EngineResult<MemoryStats> {
        let rows = self.store.query(MEMORY_COLLECTION, Query::all()).await.map_err(store_err)?;

        let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut attributed: Vec<(String, f64)> = Vec::new();

        for (id, doc) in &rows {
            if let Some(source) = doc["source"].as_str() {
                *by_source.entry(source.to_string()).or_default() += 1;
            }
            if let Some(category) = doc["category"].as_str() {
                *by_category.entry(category.to_string()).or_default() += 1;
            }
            let uses = doc["times_used_in_success"].as_u64().unwrap_or(0)
                + doc["times_used_in_failure"].as_u64().unwrap_or(0);
            if uses > 0 {
                attributed.push((id.clone(), doc["success_rate"].as_f64().unwrap_or(0.0)));
            }
        }

        let avg_success_rate = if attributed.is_empty() {
            0.0
        } else {
            attributed.iter().map(|(_, r)| r).sum::<f64>() / attributed.len() as f64
        };
        attributed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(MemoryStats {
            total: rows.len(),
            by_source,
            by_category,
            avg_success_rate,
            top_performers: attributed.into_iter().take(5).map(|(id, _)| id).collect(),
        })
    }
}

fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::UpstreamError { message: format!("store error: {e}"), step: None }
}
