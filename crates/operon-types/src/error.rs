//! Typed error taxonomy shared across the engine.
//!
//! Every failure that crosses a component boundary is one of these variants.
//! The orchestrator classifies them to decide whether a failed task is
//! eligible for auto-repair; the executor maps uncaught provider failures to
//! [`EngineError::UpstreamError`] and *returns* them rather than panicking.

use serde::{Deserialize, Serialize};

/// Result alias used at component seams.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Structured error value carrying a type, a message, and optionally the
/// execution step it was raised at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineError {
    /// Schema violation or coercion failure; lists every violated field.
    #[error("parameter validation failed: {}", violations.join("; "))]
    ParameterValidation {
        /// One entry per violated field, human readable.
        violations: Vec<String>,
    },

    /// Template id unknown and the fuzzy resolver found nothing above floor.
    #[error("template not found: {query}")]
    TemplateNotFound {
        /// The id or utterance that failed to resolve.
        query: String,
    },

    /// Banned pattern or dialect refusal before execution.
    #[error("script rejected: {reason}")]
    ScriptInvalid {
        /// Why the static validator refused the script.
        reason: String,
    },

    /// Dangerous RPC, over-limit list call, or oversized payload.
    #[error("capability refused for {method}: {reason}")]
    CapabilityRefused {
        /// The method-addressed capability call that was refused.
        method: String,
        /// Refusal reason.
        reason: String,
    },

    /// A wall-clock deadline elapsed (per task or per capability call).
    #[error("timed out after {limit_ms}ms")]
    Timeout {
        /// Step active when the deadline elapsed, if known.
        step: Option<String>,
        /// The deadline that was exceeded, in milliseconds.
        limit_ms: u64,
    },

    /// The executor's cooperative checkpoint observed a cancellation flag.
    #[error("cancelled")]
    Cancelled {
        /// Step active when cancellation was observed, if known.
        step: Option<String>,
    },

    /// A declared resource budget (memory tier) was exceeded.
    #[error("resource limit exceeded: {resource} ({current} > {limit})")]
    ResourceExceeded {
        /// Name of the exceeded resource.
        resource: String,
        /// Observed usage at the time of the violation.
        current: String,
        /// The declared limit.
        limit: String,
    },

    /// External provider signalled quota exhaustion. Disables repair.
    #[error("upstream quota exhausted: {message}")]
    UpstreamQuota {
        /// Provider message.
        message: String,
    },

    /// External provider is unavailable. Disables repair.
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable {
        /// Provider message.
        message: String,
    },

    /// Any other external provider failure.
    #[error("upstream error: {message}")]
    UpstreamError {
        /// Provider message.
        message: String,
        /// Step active when the provider failed, if known.
        step: Option<String>,
    },

    /// Retry depth exceeded; the origin task is finalised.
    #[error("repair exhausted for {task_id} after {attempts} attempts")]
    RepairExhausted {
        /// Origin task id.
        task_id: String,
        /// Number of retry attempts consumed.
        attempts: u32,
    },

    /// A contract the engine expected was broken by a store or provider.
    /// Surfaces as a bug; never retried.
    #[error("internal invariant violated: {message}")]
    InternalInvariant {
        /// What broke.
        message: String,
    },
}

impl EngineError {
    /// Stable snake_case tag for persistence into `errors[]` entries.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ParameterValidation { .. } => "parameter_validation",
            Self::TemplateNotFound { .. } => "template_not_found",
            Self::ScriptInvalid { .. } => "script_invalid",
            Self::CapabilityRefused { .. } => "capability_refused",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::ResourceExceeded { .. } => "resource_exceeded",
            Self::UpstreamQuota { .. } => "upstream_quota",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamError { .. } => "upstream_error",
            Self::RepairExhausted { .. } => "repair_exhausted",
            Self::InternalInvariant { .. } => "internal_invariant",
        }
    }

    /// The execution step the error was raised at, when one was recorded.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Timeout { step, .. }
            | Self::Cancelled { step }
            | Self::UpstreamError { step, .. } => step.as_deref(),
            _ => None,
        }
    }

    /// Whether a failure of this type may enter the auto-repair loop.
    ///
    /// Quota and availability failures are transient provider states that a
    /// rewritten script cannot fix; cancellations are user intent; invariant
    /// breaks are bugs. Everything else is fair game for repair.
    pub fn is_repair_eligible(&self) -> bool {
        !matches!(
            self,
            Self::UpstreamQuota { .. }
                | Self::UpstreamUnavailable { .. }
                | Self::Cancelled { .. }
                | Self::RepairExhausted { .. }
                | Self::InternalInvariant { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_eligibility_follows_taxonomy() {
        assert!(EngineError::Timeout { step: None, limit_ms: 1000 }.is_repair_eligible());
        assert!(EngineError::UpstreamError { message: "boom".into(), step: None }
            .is_repair_eligible());
        assert!(!EngineError::UpstreamQuota { message: "429".into() }.is_repair_eligible());
        assert!(!EngineError::UpstreamUnavailable { message: "503".into() }.is_repair_eligible());
        assert!(!EngineError::Cancelled { step: None }.is_repair_eligible());
    }

    #[test]
    fn error_type_tags_are_stable() {
        let err = EngineError::CapabilityRefused {
            method: "crm.user.admin".into(),
            reason: "dangerous".into(),
        };
        assert_eq!(err.error_type(), "capability_refused");

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "capability_refused");
    }

    #[test]
    fn step_is_surfaced_when_present() {
        let err = EngineError::UpstreamError {
            message: "missing filter".into(),
            step: Some("crm.invoice.list".into()),
        };
        assert_eq!(err.step(), Some("crm.invoice.list"));
    }
}
