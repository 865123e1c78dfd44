//! Task entity: one execution attempt of a template instance.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::task_id;

/// Default task priority when the caller does not specify one.
pub const DEFAULT_TASK_PRIORITY: u8 = 50;

/// Soft TTL applied to new tasks; expired rows are deletable.
pub const DEFAULT_TASK_TTL_DAYS: i64 = 7;

/// Lifecycle status of a task.
///
/// Transitions are monotonic: a task only ever moves forward through the
/// lifecycle, and every status in the terminal set stays terminal. The
/// original record of a repaired task ends in `AutoRepaired`; the retry gets
/// its own id and record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created and persisted, not yet handed to the dispatch transport.
    Pending,
    /// Accepted by the dispatch transport, waiting for the execute callback.
    Queued,
    /// The executor is running the script.
    Running,
    /// Finished successfully; `result` is populated.
    Completed,
    /// Finished unsuccessfully and repair declined or was ineligible.
    Failed,
    /// Cancelled by a caller; never repaired or retried.
    Cancelled,
    /// Failed, repaired, and superseded by a retry task.
    AutoRepaired,
    /// Failed with the retry depth cap exhausted.
    FailedMaxRetries,
}

impl TaskStatus {
    /// Whether this status ends the lifecycle. Terminal tasks are never
    /// re-enqueued.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::AutoRepaired | Self::FailedMaxRetries
        )
    }

    /// Whether a transition from `self` to `next` respects monotonicity.
    ///
    /// Forward jumps are allowed (e.g. `Pending -> Cancelled` when a task is
    /// cancelled before dispatch); anything out of a terminal status is not.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return false;
        }
        self.rank() < next.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Queued => 1,
            Self::Running => 2,
            _ => 3,
        }
    }

    /// Stable snake_case tag for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::AutoRepaired => "auto_repaired",
            Self::FailedMaxRetries => "failed_max_retries",
        }
    }
}

/// Progress reported by the executor while a task runs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Completion percentage, clamped to 0..=100.
    pub percentage: u8,
    /// Most recent progress message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the executor last touched this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Dispatch and execution bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Handle returned by the deferred-dispatch transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_handle: Option<String>,
    /// Worker the dispatch transport assigned, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// When the dispatch transport accepted the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    /// When the executor started running the script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When cancellation was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Resources consumed by one execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak estimated memory in bytes.
    pub memory_bytes: u64,
    /// LLM tokens consumed by in-script generation.
    pub llm_tokens: u64,
    /// Calls made to the primary data source.
    pub data_source_calls: u64,
}

/// Reference to an artefact a script produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtefactRef {
    /// Stable public URL in the object store.
    pub url: String,
    /// Original filename.
    pub name: String,
    /// Artefact content type.
    pub content_type: String,
}

/// Result of a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultData {
    /// Human-readable outcome summary.
    pub summary: String,
    /// Artefacts uploaded during execution.
    #[serde(default)]
    pub attachments: Vec<ArtefactRef>,
    /// Wall-clock execution time.
    pub execution_time_ms: u64,
    /// Resources consumed.
    pub resource_usage: ResourceUsage,
}

/// One entry of the append-only `errors[]` list.
///
/// `at` is always a concrete timestamp. The durable store forbids
/// server-clock sentinels inside array items, so these entries are stamped
/// by the process clock at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorEntry {
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// Stable error-type tag from the taxonomy.
    pub error_type: String,
    /// Human-readable message.
    pub message: String,
    /// Execution step the error was raised at, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Whether a later repair resolved this error.
    #[serde(default)]
    pub resolved: bool,
}

impl TaskErrorEntry {
    /// Build an entry from a typed engine error, stamped now.
    pub fn from_error(error: &EngineError) -> Self {
        Self {
            at: Utc::now(),
            error_type: error.error_type().to_string(),
            message: error.to_string(),
            step: error.step().map(str::to_string),
            resolved: false,
        }
    }
}

/// Repair bookkeeping stored on the *origin* record when a retry is minted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRepairInfo {
    /// The error message that triggered the repair.
    pub original_error: String,
    /// Retry attempt number the repair produced.
    pub attempt: u32,
    /// Template version the repair wrote.
    pub repaired_template_version: u32,
    /// When the repair was applied.
    pub repaired_at: DateTime<Utc>,
}

/// Cost estimate attached at creation, derived from template metadata and
/// parameter magnitudes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEstimate {
    /// Expected number of script steps.
    pub steps: u32,
    /// Expected wall-clock duration.
    pub duration_ms: u64,
    /// Relative complexity score (1.0 = template baseline).
    pub complexity: f64,
    /// Memory tier the sandbox will be granted, in megabytes.
    pub memory_tier_mb: u64,
}

/// One execution attempt of a template instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Opaque id following the task-id grammar.
    pub task_id: String,
    /// Template this task instantiates.
    pub template_id: String,
    /// Template version frozen at creation for auditability. The executor
    /// deliberately reads the *latest* version at dispatch time.
    pub template_version: u32,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Priority 0..=100; higher dispatches first.
    pub priority: u8,
    /// Non-production marker; inherited from the template unless overridden.
    pub testing: bool,
    /// Schema-conformant parameters (post-coercion).
    pub parameters: Value,
    /// User the task runs on behalf of.
    pub user_id: String,
    /// Match confidence when the task was auto-created from an utterance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Live progress.
    #[serde(default)]
    pub progress: TaskProgress,
    /// Dispatch/execution bookkeeping.
    #[serde(default)]
    pub execution: ExecutionInfo,
    /// Success payload, present once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultData>,
    /// Append-only error log.
    #[serde(default)]
    pub errors: Vec<TaskErrorEntry>,
    /// Cost estimate attached at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<TaskEstimate>,
    /// Origin task id, present on retry-tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Retry attempt number, present on retry-tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    /// Repair bookkeeping, present on origin records that were repaired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_repair_info: Option<AutoRepairInfo>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Soft TTL; rows past this instant are deletable.
    pub expires_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh pending task with defaulted bookkeeping fields.
    pub fn new(
        task_id: String,
        template_id: String,
        template_version: u32,
        parameters: Value,
        user_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            template_id,
            template_version,
            status: TaskStatus::Pending,
            priority: DEFAULT_TASK_PRIORITY,
            testing: false,
            parameters,
            user_id,
            confidence: None,
            progress: TaskProgress::default(),
            execution: ExecutionInfo::default(),
            result: None,
            errors: Vec::new(),
            estimate: None,
            parent_task_id: None,
            retry_attempt: None,
            auto_repair_info: None,
            created_at: now,
            expires_at: now + Duration::days(DEFAULT_TASK_TTL_DAYS),
        }
    }

    /// Retry depth encoded in this task's id.
    pub fn retry_depth(&self) -> u32 {
        task_id::retry_depth(&self.task_id)
    }

    /// Whether this task has expired relative to `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_transitions_are_monotonic() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(AutoRepaired));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(FailedMaxRetries));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Queued.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled, AutoRepaired, FailedMaxRetries] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Running));
            assert!(!terminal.can_transition_to(Queued));
        }
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new(
            "task_1700000000000_report".into(),
            "tmpl-1".into(),
            3,
            json!({"limit": 50}),
            "user-1".into(),
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, DEFAULT_TASK_PRIORITY);
        assert!(!task.testing);
        assert_eq!(task.retry_depth(), 0);
        assert!(task.expires_at > task.created_at);
    }

    #[test]
    fn error_entries_carry_concrete_timestamps() {
        let err = EngineError::UpstreamError {
            message: "boom".into(),
            step: Some("crm.invoice.list".into()),
        };
        let entry = TaskErrorEntry::from_error(&err);
        assert_eq!(entry.error_type, "upstream_error");
        assert_eq!(entry.step.as_deref(), Some("crm.invoice.list"));
        assert!(!entry.resolved);
        // Serialises as a concrete RFC 3339 instant, not a sentinel.
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json["at"].is_string());
    }

    #[test]
    fn status_serialises_snake_case() {
        assert_eq!(serde_json::to_value(TaskStatus::FailedMaxRetries).unwrap(), json!("failed_max_retries"));
        assert_eq!(TaskStatus::AutoRepaired.as_str(), "auto_repaired");
    }
}
