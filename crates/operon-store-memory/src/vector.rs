//! Brute-force cosine vector index.
//!
//! For the corpus sizes this engine holds (hundreds of templates, a few
//! thousand memories) a linear scan is fast enough and avoids heavy native
//! index dependencies.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use operon_store_core::{NearestHit, NearestQuery, StoreError, VectorIndex};

use crate::document::matches_filter;

#[derive(Debug, Clone)]
struct Entry {
    field: String,
    vector: Vec<f32>,
    metadata: Value,
}

/// An in-memory, non-persistent vector index.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    // collection -> doc_id -> entries (one per vector field)
    collections: RwLock<HashMap<String, HashMap<String, Vec<Entry>>>>,
}

impl MemoryVectorIndex {
    /// Creates a new, empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vectors stored for `collection`.
    pub async fn vector_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, |docs| docs.values().map(Vec::len).sum())
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(
        &self,
        collection: &str,
        doc_id: &str,
        field: &str,
        vector: Vec<f32>,
        metadata: Value,
    ) -> Result<()> {
        let mut guard = self.collections.write().await;
        let entries = guard
            .entry(collection.to_string())
            .or_default()
            .entry(doc_id.to_string())
            .or_default();
        entries.retain(|e| e.field != field);
        entries.push(Entry { field: field.to_string(), vector, metadata });
        Ok(())
    }

    async fn remove(&self, collection: &str, doc_id: &str) -> Result<()> {
        if let Some(docs) = self.collections.write().await.get_mut(collection) {
            docs.remove(doc_id);
        }
        Ok(())
    }

    async fn find_nearest(
        &self,
        collection: &str,
        query: NearestQuery,
    ) -> Result<Vec<NearestHit>> {
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<NearestHit> = Vec::new();
        for (doc_id, entries) in docs {
            for entry in entries {
                if entry.field != query.vector_field {
                    continue;
                }
                if !query.filters.iter().all(|f| matches_filter(&entry.metadata, f)) {
                    continue;
                }
                if entry.vector.len() != query.query.len() {
                    return Err(StoreError::DimensionMismatch {
                        expected: entry.vector.len(),
                        actual: query.query.len(),
                    }
                    .into());
                }
                hits.push(NearestHit {
                    doc_id: doc_id.clone(),
                    similarity: cosine_similarity(&entry.vector, &query.query),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(query.k);
        Ok(hits)
    }
}

/// Cosine similarity between two vectors of equal length.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom) as f32
    }
}
