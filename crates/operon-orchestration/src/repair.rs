//! The auto-repair loop.
//!
//! Given a failed task, the loop retrieves relevant reasoning memories,
//! asks the LLM for a minimally modified script that fixes the failure,
//! validates the candidate against the sandbox dialect and banned-pattern
//! set, applies it as the template's new version, distils the attempt into
//! memory, and delegates the retry enqueue. Repair declines - returning
//! `None`, not an error - when the failure class is quota or availability,
//! when the candidate fails validation, or when the model produces nothing
//! usable.

use tracing::{debug, info, warn};

use operon_llm_gateway::CompletionRequest;
use operon_reasoning::{RepairExtractionContext, RetrievalFilter, DEFAULT_RETRIEVAL_K};
use operon_types::{EngineError, EngineResult, MemoryCategory, Task, Template, Trajectory};

use crate::Orchestrator;

/// Caller tag for repair prompts.
const GATEWAY_CALLER: &str = "repair";

/// Run the repair loop for a failed task.
///
/// Returns the enqueued retry task, or `None` when repair declined.
pub(crate) async fn run_repair_loop(
    orchestrator: &Orchestrator,
    task: &Task,
    template: &Template,
    error: &EngineError,
    trajectory: &Trajectory,
) -> EngineResult<Option<Task>> {
    if !error.is_repair_eligible() {
        return Ok(None);
    }

    // 1. Retrieve lessons near the failure signature.
    let query = match error.step() {
        Some(step) => format!("{error}. {step}"),
        None => error.to_string(),
    };
    let memories = orchestrator
        .memory()
        .retrieve(
            &query,
            DEFAULT_RETRIEVAL_K,
            &RetrievalFilter {
                categories: vec![MemoryCategory::ErrorPattern, MemoryCategory::FixStrategy],
                template_id: None,
            },
        )
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "memory retrieval failed, repairing without lessons");
            Vec::new()
        });
    let memory_ids: Vec<String> = memories.iter().map(|m| m.memory_id.clone()).collect();

    // 2. Ask for a minimal fix.
    let candidate = match synthesise_script(orchestrator, template, error, &memories).await {
        Some(candidate) => candidate,
        None => {
            info!(task_id = %task.task_id, "repair declined: no usable candidate script");
            return Ok(None);
        }
    };

    // 3. Static validation against dialect and banned patterns.
    if let Err(validation) = orchestrator.executor().validate_script(&candidate) {
        warn!(error = %validation, "repair declined: candidate failed validation");
        distil(orchestrator, task, template, error, &template.execution_script, &candidate, false)
            .await;
        return Ok(None);
    }

    // 4. Apply as the template's new version.
    let new_version = orchestrator
        .registry_arc()
        .apply_repaired_script(&template.template_id, &candidate, "auto_repair")
        .await?;

    // 5. Distil the attempt (repair applied; retry outcome attributes later).
    distil(orchestrator, task, template, error, &template.execution_script, &candidate, true).await;

    // 6. Delegate the retry enqueue.
    let retry = orchestrator
        .retry_with_repaired_template(
            &task.task_id,
            new_version,
            &error.to_string(),
            memory_ids,
            &task.user_id,
        )
        .await?;

    debug!(
        task_id = %task.task_id,
        retry = retry.as_ref().map(|t| t.task_id.clone()).unwrap_or_default(),
        steps_recorded = trajectory.steps.len(),
        "repair loop finished"
    );
    Ok(retry)
}

/// Prompt the model for a minimally modified script. Returns `None` when
/// the response is empty or not a JSON program shape.
async fn synthesise_script(
    orchestrator: &Orchestrator,
    template: &Template,
    error: &EngineError,
    memories: &[operon_types::ReasoningMemory],
) -> Option<String> {
    let lessons = if memories.is_empty() {
        "(none)".to_string()
    } else {
        memories
            .iter()
            .map(|m| format!("- {}: {}", m.title, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let schema = serde_json::to_string(&template.parameter_schema).unwrap_or_default();
    let prompt = format!(
        "The following task script failed. Produce a minimally modified script that preserves \
         behaviour and fixes the failure.\n\nScript:\n{}\n\nError ({}): {}\n\n\
         Lessons from past repairs:\n{lessons}\n\nParameter schema: {schema}\n\n\
         Respond with only the corrected JSON step program.",
        template.execution_script,
        error.error_type(),
        error,
    );

    let request = CompletionRequest::new(prompt).ok()?.with_max_tokens(4096);
    let response = match orchestrator.gateway().complete(GATEWAY_CALLER, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "repair synthesis request failed");
            return None;
        }
    };

    let content = response.content.trim();
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if start >= end {
        return None;
    }
    Some(content[start..=end].to_string())
}

async fn distil(
    orchestrator: &Orchestrator,
    task: &Task,
    template: &Template,
    error: &EngineError,
    before: &str,
    after: &str,
    repair_succeeded: bool,
) {
    let ctx = RepairExtractionContext {
        template_id: template.template_id.clone(),
        task_id: task.task_id.clone(),
        error_summary: error.to_string(),
        script_before: before.to_string(),
        script_after: after.to_string(),
        repair_succeeded,
    };
    if let Err(e) = orchestrator.memory().extract_from_repair(&ctx).await {
        warn!(error = %e, "repair distillation failed");
    }
}
