//! Template entity: the executable definition tasks are minted from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::ParameterSchema;
use crate::Embedding;

/// Default sandbox memory tier granted to a template's tasks, in megabytes.
pub const DEFAULT_MEMORY_TIER_MB: u64 = 512;

/// A parameter-schema-plus-executable-script artefact defining a
/// reproducible task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Stable identifier.
    pub template_id: String,
    /// Short machine-friendly name, e.g. `bitrix24_missed_revenue_opportunity_report`.
    pub name: String,
    /// Human-readable description of what the template does.
    pub description: String,
    /// Category tags used for matching hints and id suffixes.
    #[serde(default)]
    pub category: Vec<String>,
    /// Monotonic version; bumped by every script update, including repairs.
    pub version: u32,
    /// Schema the task parameters must conform to.
    pub parameter_schema: ParameterSchema,
    /// Source text of the sandbox step program.
    pub execution_script: String,
    /// Excluded from matching when false; still resolvable by id.
    pub enabled: bool,
    /// Non-production marker; only selectable by opted-in callers.
    pub testing: bool,
    /// Whether the current script passed static validation.
    pub script_validated: bool,
    /// Dense vector over `name`. Required for semantic lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_embedding: Option<Embedding>,
    /// Dense vector over name + description + category + serialized schema.
    /// Required for semantic lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
    /// Legacy trigger hints. Kept as inert metadata; never consulted by the
    /// matcher.
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Expected execution duration for a baseline parameter set.
    pub estimated_duration_ms: u64,
    /// Expected number of script steps.
    pub estimated_steps: u32,
    /// Capabilities the script declares it needs.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Sandbox memory tier its tasks are granted, in megabytes.
    #[serde(default = "default_memory_tier")]
    pub memory_tier_mb: u64,
    /// Matching tie-break priority 0..=100.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// When the script was last rewritten by the repair loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_repaired_at: Option<DateTime<Utc>>,
    /// How many repairs have been applied over the template's lifetime.
    #[serde(default)]
    pub repair_attempts: u32,
    /// Who last modified the template (user id or `auto_repair`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp; a matching tie-break.
    pub updated_at: DateTime<Utc>,
}

fn default_memory_tier() -> u64 {
    DEFAULT_MEMORY_TIER_MB
}

fn default_priority() -> u8 {
    crate::task::DEFAULT_TASK_PRIORITY
}

impl Template {
    /// Create a template with defaulted bookkeeping fields.
    pub fn new(
        template_id: String,
        name: String,
        description: String,
        parameter_schema: ParameterSchema,
        execution_script: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            template_id,
            name,
            description,
            category: Vec::new(),
            version: 1,
            parameter_schema,
            execution_script,
            enabled: true,
            testing: false,
            script_validated: false,
            name_embedding: None,
            embedding: None,
            triggers: Vec::new(),
            estimated_duration_ms: 60_000,
            estimated_steps: 4,
            required_capabilities: Vec::new(),
            memory_tier_mb: DEFAULT_MEMORY_TIER_MB,
            priority: crate::task::DEFAULT_TASK_PRIORITY,
            last_repaired_at: None,
            repair_attempts: 0,
            last_modified_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Text the composite embedding is computed over.
    pub fn embedding_text(&self) -> String {
        let schema = serde_json::to_string(&self.parameter_schema).unwrap_or_default();
        format!(
            "{}. {}. {}. {}",
            self.name,
            self.description,
            self.category.join(", "),
            schema
        )
    }

    /// Whether both embeddings are present and the template may participate
    /// in semantic lookup.
    pub fn is_searchable(&self) -> bool {
        self.name_embedding.is_some() && self.embedding.is_some()
    }

    /// Primary category, used for id-suffix fallbacks.
    pub fn primary_category(&self) -> &str {
        self.category.first().map(String::as_str).unwrap_or("task")
    }
}
