//! Trajectory records: the step-by-step account of one execution, handed to
//! memory distillation after the task reaches a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::ResourceUsage;

/// Outcome of a single recorded step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StepOutcome {
    /// The step completed.
    Ok,
    /// The step failed with the given error-type tag and message.
    Err {
        /// Stable error-type tag.
        error_type: String,
        /// Human-readable message.
        message: String,
    },
}

/// One recorded execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    /// Zero-based position in the script.
    pub index: u32,
    /// Step operation (`data_source`, `llm`, `progress`, `emit`, `checkpoint`).
    pub op: String,
    /// Method or short detail, e.g. `crm.invoice.list`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Wall-clock duration of the step.
    pub duration_ms: u64,
    /// Whether the step succeeded.
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Terminal outcome of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TrajectoryOutcome {
    /// The execution completed.
    Success,
    /// The execution failed.
    Failure {
        /// Stable error-type tag of the terminal error.
        error_type: String,
        /// Human-readable message.
        message: String,
        /// Step the failure was raised at, if known.
        step: Option<String>,
    },
}

/// The recorded sequence of steps, inputs, outputs, and timings of one
/// execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Task this trajectory records.
    pub task_id: String,
    /// Template the task instantiated.
    pub template_id: String,
    /// Parameters the script ran with.
    pub parameters: Value,
    /// Recorded steps, in execution order.
    pub steps: Vec<TrajectoryStep>,
    /// Terminal outcome.
    pub outcome: TrajectoryOutcome,
    /// When the execution finished.
    pub completed_at: DateTime<Utc>,
    /// Total wall-clock time.
    pub execution_time_ms: u64,
    /// Resources consumed.
    pub resource_usage: ResourceUsage,
}

impl Trajectory {
    /// Whether the trajectory records a success.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TrajectoryOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trajectory_serialisation_shape() {
        let traj = Trajectory {
            task_id: "task_1_abc".into(),
            template_id: "tmpl-1".into(),
            parameters: json!({}),
            steps: vec![TrajectoryStep {
                index: 0,
                op: "data_source".into(),
                detail: Some("crm.invoice.list".into()),
                duration_ms: 12,
                outcome: StepOutcome::Ok,
            }],
            outcome: TrajectoryOutcome::Failure {
                error_type: "upstream_error".into(),
                message: "missing filter".into(),
                step: Some("crm.invoice.list".into()),
            },
            completed_at: Utc::now(),
            execution_time_ms: 12,
            resource_usage: ResourceUsage::default(),
        };
        assert!(!traj.is_success());
        let json = serde_json::to_value(&traj).unwrap();
        assert_eq!(json["steps"][0]["outcome"], "ok");
        assert_eq!(json["outcome"]["kind"], "failure");
    }
}
