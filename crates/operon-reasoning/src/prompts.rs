//! Source-specific extraction prompts.
//!
//! Each prompt asks for a bounded JSON array of `{title, description,
//! content, category}` objects and nothing else. The category vocabulary
//! is spelled out verbatim so the model cannot invent new tags.

use operon_types::{Trajectory, TrajectoryOutcome};

use crate::{RepairExtractionContext, UserModificationContext};

const CATEGORY_VOCAB: &str =
    "error_pattern, fix_strategy, api_usage, general_strategy, generation_pattern";

fn format_steps(trajectory: &Trajectory) -> String {
    trajectory
        .steps
        .iter()
        .map(|s| {
            format!(
                "- step {} {}{}: {}",
                s.index,
                s.op,
                s.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default(),
                match &s.outcome {
                    operon_types::StepOutcome::Ok => "ok".to_string(),
                    operon_types::StepOutcome::Err { error_type, message } =>
                        format!("{error_type}: {message}"),
                }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt for lessons from a successful execution.
pub fn success_prompt(trajectory: &Trajectory, max_candidates: usize) -> String {
    format!(
        "A task template executed successfully. Distil up to {max_candidates} reusable lessons \
         from this run.\n\nTemplate: {}\nParameters: {}\nSteps:\n{}\n\n\
         Respond with only a JSON array of objects with keys title, description, content, \
         category. Valid categories: {CATEGORY_VOCAB}. Prefer generation_pattern or \
         general_strategy for successes.",
        trajectory.template_id,
        trajectory.parameters,
        format_steps(trajectory),
    )
}

/// Prompt for lessons from a failed execution.
pub fn failure_prompt(trajectory: &Trajectory, max_candidates: usize) -> String {
    let failure = match &trajectory.outcome {
        TrajectoryOutcome::Failure { error_type, message, step } => format!(
            "{error_type} at {}: {message}",
            step.as_deref().unwrap_or("unknown step")
        ),
        TrajectoryOutcome::Success => "unknown".to_string(),
    };
    format!(
        "A task template failed. Distil up to {max_candidates} lessons that would help avoid or \
         diagnose this failure.\n\nTemplate: {}\nFailure: {failure}\nSteps:\n{}\n\n\
         Respond with only a JSON array of objects with keys title, description, content, \
         category. Valid categories: {CATEGORY_VOCAB}. Prefer error_pattern for failures.",
        trajectory.template_id,
        format_steps(trajectory),
    )
}

/// Prompt for lessons from a repair attempt.
pub fn repair_prompt(ctx: &RepairExtractionContext, max_candidates: usize) -> String {
    format!(
        "A template script was automatically rewritten after a failure. The retry {}.\n\n\
         Template: {}\nOriginal error: {}\nScript before:\n{}\n\nScript after:\n{}\n\n\
         Distil up to {max_candidates} lessons. Respond with only a JSON array of objects with \
         keys title, description, content, category. Valid categories: {CATEGORY_VOCAB}. \
         Prefer error_pattern and fix_strategy.",
        if ctx.repair_succeeded { "succeeded" } else { "failed again" },
        ctx.template_id,
        ctx.error_summary,
        ctx.script_before,
        ctx.script_after,
    )
}

/// Prompt for lessons from a human template edit.
pub fn user_modification_prompt(ctx: &UserModificationContext, max_candidates: usize) -> String {
    format!(
        "A human edited a task template. Distil up to {max_candidates} lessons about what the \
         edit improves.\n\nTemplate: {}\nEdited by: {}\nScript before:\n{}\n\nScript after:\n{}\n\n\
         Respond with only a JSON array of objects with keys title, description, content, \
         category. Valid categories: {CATEGORY_VOCAB}.",
        ctx.template_id, ctx.user_id, ctx.script_before, ctx.script_after,
    )
}
