#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-registry** – Template storage, indexing, and semantic lookup.
//!
//! The registry owns the template collection: CRUD with compare-and-set
//! version bumps, dual-embedding indexing (a vector over the bare name and
//! a composite vector over name + description + category + schema), the
//! two-phase utterance matcher, the fuzzy name/id resolver backing the
//! management surface, and the advisory TTL cache the orchestrator
//! invalidates for cache coherence after repairs.
//!
//! ## Matching
//!
//! An incoming utterance is embedded once, then:
//!
//! 1. Phase A: k-nearest against `name_embedding` (k = 5). A hit at or
//!    above 0.85 cosine similarity wins outright - users who say a
//!    template's name get that template.
//! 2. Phase B: k-nearest against the composite `embedding` (k = 10),
//!    filtered to `enabled = true`. The top hit wins if it clears the
//!    configurable floor (default 0.5); otherwise there is no match.
//!
//! Ties break on enabled, then priority, then recency. Misses are `None`,
//! never errors.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use operon_llm_gateway::{EmbeddingTaskType, LlmGateway};
use operon_store_core::{
    DocumentStore, FieldOp, Filter, NearestQuery, Query, VectorIndex,
};
use operon_types::{EngineError, EngineResult, Template};

pub mod cache;
pub mod fuzzy;

pub use cache::{TemplateCache, TEMPLATE_CACHE_TTL};
pub use fuzzy::FUZZY_SCORE_FLOOR;

/// Collection templates are stored in.
pub const TEMPLATE_COLLECTION: &str = "templates";

/// Phase-A short-circuit threshold on name similarity.
pub const NAME_MATCH_THRESHOLD: f32 = 0.85;

/// Default Phase-B semantic floor.
pub const DEFAULT_SEMANTIC_FLOOR: f32 = 0.5;

/// Phase-A neighbour count.
pub const PHASE_A_K: usize = 5;

/// Phase-B neighbour count.
pub const PHASE_B_K: usize = 10;

/// Caller tag the registry uses against the gateway.
const GATEWAY_CALLER: &str = "registry";

/// Options for utterance matching.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Whether templates in testing mode may be selected.
    pub include_testing: bool,
    /// Phase-B similarity floor.
    pub semantic_floor: f32,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self { include_testing: false, semantic_floor: DEFAULT_SEMANTIC_FLOOR }
    }
}

/// Which matching phase produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Phase A: name-embedding short circuit.
    Name,
    /// Phase B: composite-embedding search.
    Semantic,
}

/// A successful utterance match.
#[derive(Debug, Clone)]
pub struct TemplateMatch {
    /// The matched template.
    pub template: Template,
    /// Cosine similarity of the winning hit.
    pub similarity: f32,
    /// Phase that produced it.
    pub phase: MatchPhase,
}

/// Partial metadata update applied by [`TemplateRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct TemplatePatch {
    /// New machine-friendly name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New category tags.
    pub category: Option<Vec<String>>,
    /// New matching priority.
    pub priority: Option<u8>,
    /// New duration estimate.
    pub estimated_duration_ms: Option<u64>,
    /// New step estimate.
    pub estimated_steps: Option<u32>,
    /// Who is making the change.
    pub last_modified_by: Option<String>,
}

/// Template registry over a document store, a vector index, and the
/// embedding gateway.
pub struct TemplateRegistry {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    gateway: Arc<LlmGateway>,
    cache: TemplateCache,
}

impl TemplateRegistry {
    /// Build a registry over the given capabilities.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        gateway: Arc<LlmGateway>,
    ) -> Self {
        Self { store, index, gateway, cache: TemplateCache::default() }
    }

    //─────────────────────────────
    //  CRUD
    //─────────────────────────────

    /// Store a template, computing both embeddings and indexing them.
    pub async fn put(&self, mut template: Template) -> EngineResult<Template> {
        let name_embedding = self
            .gateway
            .embed(GATEWAY_CALLER, &template.name, EmbeddingTaskType::RetrievalDocument)
            .await?;
        let composite = self
            .gateway
            .embed(
                GATEWAY_CALLER,
                &template.embedding_text(),
                EmbeddingTaskType::RetrievalDocument,
            )
            .await?;
        template.name_embedding = Some(name_embedding.clone());
        template.embedding = Some(composite.clone());
        template.updated_at = Utc::now();

        let doc = serde_json::to_value(&template).map_err(internal)?;
        self.store
            .put(TEMPLATE_COLLECTION, &template.template_id, doc)
            .await
            .map_err(store_err)?;

        let metadata = index_metadata(&template);
        self.index
            .upsert(
                TEMPLATE_COLLECTION,
                &template.template_id,
                "name_embedding",
                name_embedding,
                metadata.clone(),
            )
            .await
            .map_err(store_err)?;
        self.index
            .upsert(TEMPLATE_COLLECTION, &template.template_id, "embedding", composite, metadata)
            .await
            .map_err(store_err)?;

        self.cache.insert(template.clone());
        info!(template_id = %template.template_id, name = %template.name, "template stored");
        Ok(template)
    }

    /// Fetch a template, serving fresh cache entries when present.
    ///
    /// Id lookup deliberately ignores `enabled`: disabling only removes a
    /// template from matching.
    pub async fn get(&self, id: &str) -> EngineResult<Option<Template>> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(Some(cached));
        }
        let Some(doc) = self.store.get(TEMPLATE_COLLECTION, id).await.map_err(store_err)? else {
            return Ok(None);
        };
        let template: Template = serde_json::from_value(doc).map_err(internal)?;
        self.cache.insert(template.clone());
        Ok(Some(template))
    }

    /// Fetch a template or fail with [`EngineError::TemplateNotFound`].
    pub async fn get_required(&self, id: &str) -> EngineResult<Template> {
        self.get(id)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound { query: id.to_string() })
    }

    /// Apply a metadata patch.
    ///
    /// Routed through [`TemplateRegistry::put`] so name, description, and
    /// category changes recompute both embeddings and refresh the index
    /// metadata in one pass.
    pub async fn update(&self, id: &str, patch: TemplatePatch) -> EngineResult<Template> {
        let mut template = self.get_required(id).await?;
        if let Some(name) = patch.name {
            template.name = name;
        }
        if let Some(description) = patch.description {
            template.description = description;
        }
        if let Some(category) = patch.category {
            template.category = category;
        }
        if let Some(priority) = patch.priority {
            template.priority = priority.min(100);
        }
        if let Some(duration) = patch.estimated_duration_ms {
            template.estimated_duration_ms = duration;
        }
        if let Some(steps) = patch.estimated_steps {
            template.estimated_steps = steps;
        }
        if patch.last_modified_by.is_some() {
            template.last_modified_by = patch.last_modified_by;
        }
        self.put(template).await
    }

    /// Delete a template and its index entries.
    pub async fn delete(&self, id: &str) -> EngineResult<()> {
        self.store.delete(TEMPLATE_COLLECTION, id).await.map_err(store_err)?;
        self.index.remove(TEMPLATE_COLLECTION, id).await.map_err(store_err)?;
        self.cache.invalidate(id);
        Ok(())
    }

    /// All templates, optionally only enabled ones.
    pub async fn list(&self, enabled_only: bool) -> EngineResult<Vec<Template>> {
        let mut query = Query::all();
        if enabled_only {
            query = query.filter("enabled", operon_store_core::FilterOp::Eq, json!(true));
        }
        let rows = self.store.query(TEMPLATE_COLLECTION, query).await.map_err(store_err)?;
        rows.into_iter()
            .map(|(_, doc)| serde_json::from_value(doc).map_err(internal))
            .collect()
    }

    /// Replace a template's script with a repaired version.
    ///
    /// Compare-and-set on `version`: concurrent repairs cannot silently
    /// overwrite each other. Bumps `version`, stamps `last_repaired_at`,
    /// increments `repair_attempts`, and invalidates the cache entry.
    pub async fn apply_repaired_script(
        &self,
        id: &str,
        script: &str,
        modified_by: &str,
    ) -> EngineResult<u32> {
        for _ in 0..3 {
            let current = self.get_required(id).await?;
            let new_version = current.version + 1;
            let applied = self
                .store
                .update_if(
                    TEMPLATE_COLLECTION,
                    id,
                    "version",
                    json!(current.version),
                    vec![
                        ("execution_script".to_string(), FieldOp::Set(json!(script))),
                        ("version".to_string(), FieldOp::Set(json!(new_version))),
                        ("script_validated".to_string(), FieldOp::Set(json!(true))),
                        (
                            "last_repaired_at".to_string(),
                            FieldOp::Set(json!(Utc::now().to_rfc3339())),
                        ),
                        ("repair_attempts".to_string(), FieldOp::Increment(1)),
                        ("updated_at".to_string(), FieldOp::Set(json!(Utc::now().to_rfc3339()))),
                        ("last_modified_by".to_string(), FieldOp::Set(json!(modified_by))),
                    ],
                )
                .await
                .map_err(store_err)?;
            if applied {
                self.cache.invalidate(id);
                info!(template_id = %id, version = new_version, "repaired script applied");
                return Ok(new_version);
            }
            debug!(template_id = %id, "version raced, retrying compare-and-set");
            self.cache.invalidate(id);
        }
        Err(EngineError::InternalInvariant {
            message: format!("compare-and-set on template {id} failed repeatedly"),
        })
    }

    /// Toggle matching eligibility.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> EngineResult<()> {
        self.set_flag(id, "enabled", enabled).await
    }

    /// Toggle testing mode.
    pub async fn set_testing(&self, id: &str, testing: bool) -> EngineResult<()> {
        self.set_flag(id, "testing", testing).await
    }

    async fn set_flag(&self, id: &str, field: &str, value: bool) -> EngineResult<()> {
        self.store
            .update(
                TEMPLATE_COLLECTION,
                id,
                vec![
                    (field.to_string(), FieldOp::Set(json!(value))),
                    ("updated_at".to_string(), FieldOp::Set(json!(Utc::now().to_rfc3339()))),
                ],
            )
            .await
            .map_err(store_err)?;
        self.cache.invalidate(id);
        // Index metadata must track the flags the pre-filters use.
        if let Some(template) = self.get(id).await? {
            let metadata = index_metadata(&template);
            if let (Some(name_vec), Some(composite)) =
                (template.name_embedding.clone(), template.embedding.clone())
            {
                self.index
                    .upsert(TEMPLATE_COLLECTION, id, "name_embedding", name_vec, metadata.clone())
                    .await
                    .map_err(store_err)?;
                self.index
                    .upsert(TEMPLATE_COLLECTION, id, "embedding", composite, metadata)
                    .await
                    .map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Invalidate the cache entry for `id`.
    ///
    /// The orchestrator calls this before a retry executes; see the cache
    /// coherence requirement in the module docs.
    pub fn invalidate_cache(&self, id: &str) {
        self.cache.invalidate(id);
    }

    //─────────────────────────────
    //  Matching
    //─────────────────────────────

    /// Dual-embedding utterance match. Returns `None` when nothing clears
    /// the thresholds; never errors on a miss.
    pub async fn find_by_utterance(
        &self,
        utterance: &str,
        opts: &MatchOptions,
    ) -> EngineResult<Option<TemplateMatch>> {
        let query_vector = self
            .gateway
            .embed(GATEWAY_CALLER, utterance, EmbeddingTaskType::RetrievalQuery)
            .await?;

        let filters = match_filters(opts);

        // Phase A: exact-name intent.
        let name_hits = self
            .index
            .find_nearest(
                TEMPLATE_COLLECTION,
                NearestQuery {
                    vector_field: "name_embedding".to_string(),
                    query: query_vector.clone(),
                    k: PHASE_A_K,
                    filters: filters.clone(),
                },
            )
            .await
            .map_err(store_err)?;

        if let Some(best) = self.rank_hits(&name_hits).await? {
            if best.1 >= NAME_MATCH_THRESHOLD {
                debug!(template_id = %best.0.template_id, similarity = best.1, "phase-A name match");
                return Ok(Some(TemplateMatch {
                    template: best.0,
                    similarity: best.1,
                    phase: MatchPhase::Name,
                }));
            }
        }

        // Phase B: semantic match over the composite embedding.
        let semantic_hits = self
            .index
            .find_nearest(
                TEMPLATE_COLLECTION,
                NearestQuery {
                    vector_field: "embedding".to_string(),
                    query: query_vector,
                    k: PHASE_B_K,
                    filters,
                },
            )
            .await
            .map_err(store_err)?;

        match self.rank_hits(&semantic_hits).await? {
            Some((template, similarity)) if similarity >= opts.semantic_floor => {
                debug!(template_id = %template.template_id, similarity, "phase-B semantic match");
                Ok(Some(TemplateMatch { template, similarity, phase: MatchPhase::Semantic }))
            }
            _ => {
                debug!(utterance, "no template cleared the matching thresholds");
                Ok(None)
            }
        }
    }

    /// Load hit templates and order them by similarity with the contract
    /// tie-breaks (enabled, priority, recency).
    async fn rank_hits(
        &self,
        hits: &[operon_store_core::NearestHit],
    ) -> EngineResult<Option<(Template, f32)>> {
        let mut candidates: Vec<(Template, f32)> = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.get(&hit.doc_id).await? {
                Some(template) if template.is_searchable() => {
                    candidates.push((template, hit.similarity));
                }
                Some(_) => warn!(template_id = %hit.doc_id, "indexed template lacks embeddings"),
                None => warn!(template_id = %hit.doc_id, "index points at a missing template"),
            }
        }
        candidates.sort_by(|(ta, sa), (tb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tb.enabled.cmp(&ta.enabled))
                .then_with(|| tb.priority.cmp(&ta.priority))
                .then_with(|| tb.updated_at.cmp(&ta.updated_at))
        });
        Ok(candidates.into_iter().next())
    }

    /// Fuzzy name/id resolution for the management surface. Misses are
    /// `None`, never errors.
    pub async fn get_by_name_fuzzy(&self, input: &str) -> EngineResult<Option<Template>> {
        let templates = self.list(false).await?;
        Ok(fuzzy::resolve(&templates, input).map(|(t, score)| {
            debug!(template_id = %t.template_id, score, "fuzzy resolution hit");
            t.clone()
        }))
    }
}

fn match_filters(opts: &MatchOptions) -> Vec<Filter> {
    let mut filters = vec![Filter::eq("enabled", json!(true))];
    if !opts.include_testing {
        filters.push(Filter::eq("testing", json!(false)));
    }
    filters
}

fn index_metadata(template: &Template) -> Value {
    json!({
        "enabled": template.enabled,
        "testing": template.testing,
        "priority": template.priority,
        "updated_at": template.updated_at.to_rfc3339(),
    })
}

fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::UpstreamError { message: format!("store error: {e}"), step: None }
}

fn internal(e: serde_json::Error) -> EngineError {
    EngineError::InternalInvariant { message: format!("template serialisation: {e}") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_llm_gateway::testing::ScriptedProvider;
    use operon_store_memory::{MemoryDocumentStore, MemoryVectorIndex};
    use operon_types::ParameterSchema;

    struct Fixture {
        registry: TemplateRegistry,
        provider_handle: Arc<ScriptedProvider>,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(ScriptedProvider::new());
        let gateway = Arc::new(LlmGateway::with_rate_limit(
            Arc::clone(&provider) as Arc<dyn operon_llm_gateway::LlmProvider>,
            10_000,
        ));
        let registry = TemplateRegistry::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryVectorIndex::new()),
            gateway,
        );
        Fixture { registry, provider_handle: provider }
    }

    fn template(id: &str, name: &str) -> Template {
        Template::new(
            id.to_string(),
            name.to_string(),
            format!("{name} description"),
            ParameterSchema::empty(),
            r#"{"steps":[{"op":"checkpoint"}]}"#.to_string(),
        )
    }

    /// Pin embeddings so similarity orderings are fully controlled.
    fn pin(f: &Fixture, text: &str, axis: usize) {
        f.provider_handle.set_embedding(text, ScriptedProvider::one_hot(axis));
    }

    #[tokio::test]
    async fn put_indexes_both_embeddings() {
        let f = fixture();
        let stored = f.registry.put(template("t1", "missed_revenue_report")).await.unwrap();
        assert!(stored.is_searchable());

        let fetched = f.registry.get("t1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "missed_revenue_report");
    }

    #[tokio::test]
    async fn phase_a_short_circuits_on_name_similarity() {
        let f = fixture();
        let tmpl = template("t1", "missed_revenue_report");
        pin(&f, "missed_revenue_report", 0);
        pin(&f, &tmpl.embedding_text(), 1);
        // The utterance embeds onto the same axis as the template name.
        pin(&f, "generate missed revenue report for last quarter", 0);
        f.registry.put(tmpl).await.unwrap();

        let m = f
            .registry
            .find_by_utterance("generate missed revenue report for last quarter", &MatchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.template.template_id, "t1");
        assert_eq!(m.phase, MatchPhase::Name);
        assert!(m.similarity >= NAME_MATCH_THRESHOLD);
    }

    #[tokio::test]
    async fn phase_b_requires_the_floor() {
        let f = fixture();
        let tmpl = template("t1", "payroll_export");
        pin(&f, "payroll_export", 0);
        pin(&f, &tmpl.embedding_text(), 1);
        // Orthogonal query: no phase-A hit, no phase-B hit above floor.
        pin(&f, "draw me a picture of a horse", 2);
        f.registry.put(tmpl).await.unwrap();

        let miss = f
            .registry
            .find_by_utterance("draw me a picture of a horse", &MatchOptions::default())
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn disabled_templates_never_match_but_resolve_by_id() {
        let f = fixture();
        let tmpl = template("t1", "missed_revenue_report");
        pin(&f, "missed_revenue_report", 0);
        pin(&f, &tmpl.embedding_text(), 0);
        pin(&f, "missed revenue report", 0);
        f.registry.put(tmpl).await.unwrap();
        f.registry.set_enabled("t1", false).await.unwrap();

        let miss = f
            .registry
            .find_by_utterance("missed revenue report", &MatchOptions::default())
            .await
            .unwrap();
        assert!(miss.is_none());

        // Direct id lookup still works.
        assert!(f.registry.get("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn testing_templates_need_opt_in() {
        let f = fixture();
        let tmpl = template("t1", "missed_revenue_report");
        pin(&f, "missed_revenue_report", 0);
        pin(&f, &tmpl.embedding_text(), 0);
        pin(&f, "missed revenue report", 0);
        f.registry.put(tmpl).await.unwrap();
        f.registry.set_testing("t1", true).await.unwrap();

        let default_miss = f
            .registry
            .find_by_utterance("missed revenue report", &MatchOptions::default())
            .await
            .unwrap();
        assert!(default_miss.is_none());

        let opted = f
            .registry
            .find_by_utterance(
                "missed revenue report",
                &MatchOptions { include_testing: true, ..MatchOptions::default() },
            )
            .await
            .unwrap();
        assert!(opted.is_some());
    }

    #[tokio::test]
    async fn repaired_scripts_bump_version_and_defeat_the_cache() {
        let f = fixture();
        f.registry.put(template("t1", "report")).await.unwrap();

        // Warm the cache.
        let before = f.registry.get("t1").await.unwrap().unwrap();
        assert_eq!(before.version, 1);

        let repaired = r#"{"steps":[{"op":"progress","percentage":100}]}"#;
        let version = f
            .registry
            .apply_repaired_script("t1", repaired, "auto_repair")
            .await
            .unwrap();
        assert_eq!(version, 2);

        // The next read observes the new script bytes immediately.
        let after = f.registry.get("t1").await.unwrap().unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.execution_script, repaired);
        assert_eq!(after.repair_attempts, 1);
        assert!(after.last_repaired_at.is_some());
    }

    #[tokio::test]
    async fn metadata_patches_re_embed_and_bump_recency() {
        let f = fixture();
        let stored = f.registry.put(template("t1", "old_name")).await.unwrap();

        let updated = f
            .registry
            .update(
                "t1",
                TemplatePatch {
                    name: Some("new_name".to_string()),
                    priority: Some(90),
                    last_modified_by: Some("user-7".to_string()),
                    ..TemplatePatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "new_name");
        assert_eq!(updated.priority, 90);
        assert_eq!(updated.last_modified_by.as_deref(), Some("user-7"));
        assert!(updated.updated_at >= stored.updated_at);
        assert_eq!(updated.version, stored.version, "metadata patches do not bump the version");
        assert!(updated.is_searchable());
    }

    #[tokio::test]
    async fn deleted_templates_vanish_from_lookup() {
        let f = fixture();
        f.registry.put(template("t1", "report")).await.unwrap();
        f.registry.delete("t1").await.unwrap();
        assert!(f.registry.get("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fuzzy_resolution_uses_synonyms() {
        let f = fixture();
        f.registry.put(template("t1", "lost_revenue_summary")).await.unwrap();
        let hit = f.registry.get_by_name_fuzzy("missed revenue report").await.unwrap();
        assert_eq!(hit.unwrap().template_id, "t1");
    }

    #[tokio::test]
    async fn utterance_miss_on_empty_registry_is_none_not_error() {
        let f = fixture();
        let miss = f
            .registry
            .find_by_utterance("anything at all", &MatchOptions::default())
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}
