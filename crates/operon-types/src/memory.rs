//! Reasoning memory entity: a distilled, embedded, retrievable lesson.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Embedding;

/// Maximum title length, in characters.
pub const MEMORY_TITLE_MAX: usize = 200;

/// Maximum description length, in characters.
pub const MEMORY_DESCRIPTION_MAX: usize = 500;

/// Maximum content length, in characters.
pub const MEMORY_CONTENT_MAX: usize = 5000;

/// Per-template memory cap; oldest-first eviction applies beyond it.
pub const PER_TEMPLATE_MEMORY_QUOTA: usize = 100;

/// What kind of lesson a memory captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// A recurring error signature and its meaning.
    ErrorPattern,
    /// A strategy that fixed a class of failures.
    FixStrategy,
    /// How an external API wants to be called.
    ApiUsage,
    /// A broadly applicable execution strategy.
    GeneralStrategy,
    /// A pattern observed while generating scripts or parameters.
    GenerationPattern,
}

impl MemoryCategory {
    /// All valid categories, for validation.
    pub const ALL: [MemoryCategory; 5] = [
        Self::ErrorPattern,
        Self::FixStrategy,
        Self::ApiUsage,
        Self::GeneralStrategy,
        Self::GenerationPattern,
    ];

    /// Parse a snake_case tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error_pattern" => Some(Self::ErrorPattern),
            "fix_strategy" => Some(Self::FixStrategy),
            "api_usage" => Some(Self::ApiUsage),
            "general_strategy" => Some(Self::GeneralStrategy),
            "generation_pattern" => Some(Self::GenerationPattern),
            _ => None,
        }
    }

    /// Stable snake_case tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorPattern => "error_pattern",
            Self::FixStrategy => "fix_strategy",
            Self::ApiUsage => "api_usage",
            Self::GeneralStrategy => "general_strategy",
            Self::GenerationPattern => "generation_pattern",
        }
    }
}

/// Where a memory was distilled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// A successful execution trajectory.
    TaskSuccess,
    /// A failed execution trajectory.
    TaskFailure,
    /// A repair that led to a passing retry.
    RepairSuccess,
    /// A repair whose retry failed again.
    RepairFailure,
    /// A human editing a template.
    UserModification,
}

impl MemorySource {
    /// All valid sources, for validation.
    pub const ALL: [MemorySource; 5] = [
        Self::TaskSuccess,
        Self::TaskFailure,
        Self::RepairSuccess,
        Self::RepairFailure,
        Self::UserModification,
    ];

    /// Whether this source records a failure. Failure-sourced memories must
    /// be created with a zero success rate.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::TaskFailure | Self::RepairFailure)
    }

    /// Stable snake_case tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskSuccess => "task_success",
            Self::TaskFailure => "task_failure",
            Self::RepairSuccess => "repair_success",
            Self::RepairFailure => "repair_failure",
            Self::UserModification => "user_modification",
        }
    }
}

/// The free-form request and fixed-shape intent flags captured alongside a
/// memory when the originating utterance is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIntent {
    /// The raw user request.
    pub raw_request: String,
    /// Fixed-shape intent flags (e.g. `{"wants_report": true}`).
    #[serde(default)]
    pub flags: Value,
}

/// A distilled, embedded, retrievable lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningMemory {
    /// Stable identifier.
    pub memory_id: String,
    /// Short lesson title (≤ 200 chars).
    pub title: String,
    /// One-paragraph summary (≤ 500 chars).
    pub description: String,
    /// Full lesson body (≤ 5000 chars).
    pub content: String,
    /// Lesson kind.
    pub category: MemoryCategory,
    /// Provenance.
    pub source: MemorySource,
    /// Template the lesson is scoped to, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Task the lesson was distilled from, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Dense vector over `title + description + content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Embedding>,
    /// How many times retrieval surfaced this memory.
    #[serde(default)]
    pub times_retrieved: u64,
    /// Retrievals that fed into a successful execution.
    #[serde(default)]
    pub times_used_in_success: u64,
    /// Retrievals that fed into a failed execution.
    #[serde(default)]
    pub times_used_in_failure: u64,
    /// `success / (success + failure)`; 0.0 before any attribution.
    #[serde(default)]
    pub success_rate: f64,
    /// Originating utterance, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_intent: Option<UserIntent>,
    /// Creation timestamp; eviction is oldest-first on this field.
    pub created_at: DateTime<Utc>,
}

impl ReasoningMemory {
    /// Text the embedding is computed over.
    pub fn embedding_text(&self) -> String {
        format!("{}. {}. {}", self.title, self.description, self.content)
    }

    /// Recompute `success_rate` from the attribution counters.
    pub fn recompute_success_rate(&mut self) {
        let total = self.times_used_in_success + self.times_used_in_failure;
        self.success_rate = if total == 0 {
            0.0
        } else {
            self.times_used_in_success as f64 / total as f64
        };
    }
}

/// Aggregate statistics over the memory store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Total stored memories.
    pub total: usize,
    /// Count per source tag.
    pub by_source: std::collections::BTreeMap<String, usize>,
    /// Count per category tag.
    pub by_category: std::collections::BTreeMap<String, usize>,
    /// Mean success rate over memories with at least one attribution.
    pub avg_success_rate: f64,
    /// Ids of the highest-success-rate memories, best first.
    pub top_performers: Vec<String>,
}
