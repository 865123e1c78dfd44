#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-orchestration** – End-to-end task lifecycle for the Operon
//! engine.
//!
//! The orchestrator owns every task from creation to terminal status:
//!
//! - **Creation**: parameters are coerced against the template schema, a
//!   cost estimate is attached, the task is persisted as `pending`, and the
//!   deferred-dispatch transport is asked to deliver the execute callback.
//! - **Auto-creation**: a free-form utterance is matched against the
//!   registry; parameters come verbatim from the tool surface when
//!   pre-extracted, otherwise from a schema-guided LLM extraction with
//!   schema defaults as the fallback.
//! - **Execution**: the dispatch callback loads the task, refuses anything
//!   not `pending|queued` (at-least-once transports re-deliver), waits for
//!   one of the bounded dispatch slots (default 4 concurrent executions),
//!   invalidates the template cache so repaired scripts are observed, and
//!   hands the latest script to the sandbox.
//! - **Repair**: eligible failures re-synthesise the script via the LLM
//!   with retrieved reasoning memories, bump the template version, and
//!   enqueue a depth-capped retry in testing mode.
//! - **Maintenance**: periodic loops publish queue statistics, drop expired
//!   tasks, and crash-mark stale workers.
//!
//! Reasoning memory is strictly downstream: trajectories flow to it after
//! terminal status, and it never calls back into orchestration.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use operon_llm_gateway::{CompletionRequest, LlmGateway};
use operon_registry::{MatchOptions, TemplateRegistry};
use operon_reasoning::MemoryService;
use operon_sandbox::{
    CapabilityEnvelope, DataSourceProvider, GuardedDataSource, RateGate, SandboxExecutor,
    SandboxLimits, ScriptPolicy, TaskStateMirror,
};
use operon_store_core::{
    server_timestamp, DeferredDispatch, DocumentStore, FieldOp, FilterOp, ObjectStore, Query,
};
use operon_sandbox::capability::ScriptLogger;
use operon_types::{
    task_id, AutoRepairInfo, EngineError, EngineResult, Task, TaskErrorEntry, TaskStatus, Template,
    Trajectory, TrajectoryOutcome, DEFAULT_TASK_PRIORITY,
};

pub mod context;
pub mod estimate;
pub mod queue;
pub mod repair;

pub use context::ContextCache;
pub use queue::{QueueMaintenance, QueueStats};

/// Collection tasks are stored in.
pub const TASK_COLLECTION: &str = "tasks";

/// Collection workers are mirrored in.
pub const WORKER_COLLECTION: &str = "workers";

/// Dispatch target name the execute callback is registered under.
pub const EXECUTE_TARGET: &str = "execute";

/// Confidence attached to utterance auto-matches.
pub const AUTO_MATCH_CONFIDENCE: f64 = 0.85;

/// Global cap on tasks this process executes concurrently. The per-worker
/// `max_concurrent_tasks` bound and the transport's own rate limits layer
/// on top of this.
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 4;

/// Caller tag used against the gateway for orchestration prompts.
const GATEWAY_CALLER: &str = "orchestrator";

/// Options for explicit task creation.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Priority 0..=100; defaults to 50.
    pub priority: Option<u8>,
    /// Explicit testing override; defaults to the template's flag.
    pub testing: Option<bool>,
    /// Match confidence to record, when the task came from a matcher.
    pub confidence: Option<f64>,
}

/// The orchestration engine.
pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
    dispatch: Arc<dyn DeferredDispatch>,
    objects: Arc<dyn ObjectStore>,
    data_source: Arc<dyn DataSourceProvider>,
    gateway: Arc<LlmGateway>,
    registry: Arc<TemplateRegistry>,
    memory: Arc<MemoryService>,
    policy: Arc<ScriptPolicy>,
    executor: SandboxExecutor,
    rate_gate: Arc<RateGate>,
    contexts: ContextCache,
    /// Admission gate bounding concurrently executing tasks.
    dispatch_slots: Arc<Semaphore>,
    /// Memories retrieved into a pending retry, attributed once the retry
    /// reaches a terminal status.
    pending_attributions: DashMap<String, Vec<String>>,
}

impl Orchestrator {
    /// Wire up the orchestrator over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatch: Arc<dyn DeferredDispatch>,
        objects: Arc<dyn ObjectStore>,
        data_source: Arc<dyn DataSourceProvider>,
        gateway: Arc<LlmGateway>,
        registry: Arc<TemplateRegistry>,
        memory: Arc<MemoryService>,
    ) -> Self {
        let policy = Arc::new(ScriptPolicy::new());
        Self {
            store,
            dispatch,
            objects,
            data_source,
            gateway,
            registry,
            memory,
            executor: SandboxExecutor::new(Arc::clone(&policy)),
            policy,
            rate_gate: Arc::new(RateGate::new()),
            contexts: ContextCache::new(),
            dispatch_slots: Arc::new(Semaphore::new(DEFAULT_DISPATCH_CONCURRENCY)),
            pending_attributions: DashMap::new(),
        }
    }

    /// Override the global dispatch concurrency bound.
    pub fn with_dispatch_concurrency(mut self, slots: usize) -> Self {
        self.dispatch_slots = Arc::new(Semaphore::new(slots.max(1)));
        self
    }

    /// Registry handle (management surface).
    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Conversation-context cache.
    pub fn contexts(&self) -> &ContextCache {
        &self.contexts
    }

    //─────────────────────────────
    //  Creation
    //─────────────────────────────

    /// Create a task from a known template.
    #[instrument(skip(self, parameters, opts))]
    pub async fn create_from_template(
        &self,
        template_id: &str,
        parameters: Value,
        user_id: &str,
        opts: CreateOptions,
    ) -> EngineResult<Task> {
        let template = self.registry.get_required(template_id).await?;
        let coerced = operon_coerce::validate(&parameters, &template.parameter_schema)?;

        let suffix = self.generate_id_suffix(&template, None).await;
        let mut task = Task::new(
            task_id::mint(&suffix),
            template.template_id.clone(),
            template.version,
            coerced,
            user_id.to_string(),
        );
        task.priority = opts.priority.unwrap_or(DEFAULT_TASK_PRIORITY).min(100);
        task.testing = opts.testing.unwrap_or(template.testing);
        task.confidence = opts.confidence;
        task.estimate = Some(estimate::estimate(&template, &task.parameters));

        self.persist_and_enqueue(task).await
    }

    /// Create a task from a free-form utterance, if anything matches.
    ///
    /// Pre-extracted `enhanced_parameters` are used verbatim; otherwise the
    /// LLM extracts parameters shaped by the template schema, falling back
    /// to schema defaults when its output does not parse.
    #[instrument(skip(self, enhanced_parameters))]
    pub async fn auto_create_from_utterance(
        &self,
        utterance: &str,
        conversation_key: Option<&str>,
        user_id: &str,
        enhanced_parameters: Option<Value>,
    ) -> EngineResult<Option<Task>> {
        let Some(matched) = self
            .registry
            .find_by_utterance(utterance, &MatchOptions::default())
            .await?
        else {
            debug!(utterance, "no template matched; refusing to create a task");
            return Ok(None);
        };
        info!(
            template_id = %matched.template.template_id,
            similarity = matched.similarity,
            "template matched for utterance"
        );

        let parameters = match enhanced_parameters {
            Some(parameters) => parameters,
            None => self.extract_parameters(&matched.template, utterance).await,
        };

        if let Some(key) = conversation_key {
            self.contexts.insert(
                key,
                json!({
                    "last_utterance": utterance,
                    "last_template_id": matched.template.template_id,
                    "at": Utc::now().to_rfc3339(),
                }),
            );
        }

        let task = self
            .create_from_template(
                &matched.template.template_id,
                parameters,
                user_id,
                CreateOptions { confidence: Some(AUTO_MATCH_CONFIDENCE), ..CreateOptions::default() },
            )
            .await?;
        Ok(Some(task))
    }

    /// Schema-guided parameter extraction with a defaults fallback.
    async fn extract_parameters(&self, template: &Template, utterance: &str) -> Value {
        let schema_json =
            serde_json::to_string(&template.parameter_schema).unwrap_or_else(|_| "{}".to_string());
        let prompt = format!(
            "Extract the parameters for task template '{}' from this request.\n\
             Request: {utterance}\nToday's date: {}\nParameter schema: {schema_json}\n\
             Respond with only a JSON object of parameter values. Use schema defaults for \
             anything the request does not specify.",
            template.name,
            Utc::now().format("%Y-%m-%d"),
        );

        let request = match CompletionRequest::new(prompt) {
            Ok(request) => request.with_max_tokens(512),
            Err(_) => return json!({}),
        };
        match self.gateway.complete(GATEWAY_CALLER, request).await {
            Ok(response) => match extract_json_object(&response.content) {
                Some(parameters) => parameters,
                None => {
                    warn!("parameter extraction did not return an object, using schema defaults");
                    json!({})
                }
            },
            Err(error) => {
                warn!(%error, "parameter extraction failed, using schema defaults");
                json!({})
            }
        }
    }

    /// LLM-assisted contextual id suffix with a deterministic fallback.
    async fn generate_id_suffix(&self, template: &Template, text: Option<&str>) -> String {
        let prompt = format!(
            "Produce a short lowercase tag (3-20 chars, [a-z0-9_]) naming this task.\n\
             Template category: {}\nRequest: {}\nRespond with only the tag.",
            template.primary_category(),
            text.unwrap_or(&template.name),
        );
        let fallback = || task_id::fallback_suffix(template.primary_category());

        let Ok(request) = CompletionRequest::new(prompt) else {
            return fallback();
        };
        match self.gateway.complete(GATEWAY_CALLER, request.with_max_tokens(16)).await {
            Ok(response) => {
                let candidate = task_id::mint(response.content.trim());
                // Reuse the grammar check by minting and validating.
                if task_id::is_valid(&candidate) {
                    candidate.splitn(3, '_').nth(2).map(str::to_string).unwrap_or_else(fallback)
                } else {
                    fallback()
                }
            }
            Err(_) => fallback(),
        }
    }

    async fn persist_and_enqueue(&self, mut task: Task) -> EngineResult<Task> {
        let doc = serde_json::to_value(&task).map_err(internal)?;
        self.store
            .put(TASK_COLLECTION, &task.task_id, doc)
            .await
            .map_err(store_err)?;

        let payload = json!({
            "task_id": task.task_id,
            "template_id": task.template_id,
            "parameters": task.parameters,
            "user_id": task.user_id,
            "priority": task.priority,
        });
        let handle = self
            .dispatch
            .enqueue(EXECUTE_TARGET, payload, None, Some(task.priority))
            .await
            .map_err(|e| EngineError::UpstreamError {
                message: format!("dispatch enqueue failed: {e}"),
                step: None,
            })?;

        self.store
            .update(
                TASK_COLLECTION,
                &task.task_id,
                vec![
                    ("execution.dispatch_handle".to_string(), FieldOp::Set(json!(handle.0))),
                    ("execution.enqueued_at".to_string(), FieldOp::Set(server_timestamp())),
                ],
            )
            .await
            .map_err(store_err)?;
        // The callback may already have started; never regress `running`.
        let queued = self
            .store
            .update_if(
                TASK_COLLECTION,
                &task.task_id,
                "status",
                json!(TaskStatus::Pending.as_str()),
                vec![("status".to_string(), FieldOp::Set(json!(TaskStatus::Queued.as_str())))],
            )
            .await
            .map_err(store_err)?;

        if queued {
            task.status = TaskStatus::Queued;
        }
        task.execution.dispatch_handle = Some(handle.0.clone());
        task.execution.enqueued_at = Some(Utc::now());
        info!(task_id = %task.task_id, priority = task.priority, "task enqueued");
        Ok(task)
    }

    //─────────────────────────────
    //  Execution
    //─────────────────────────────

    /// Dispatch callback: run one task to a terminal status.
    ///
    /// Idempotent under re-delivery: anything not `pending|queued` is
    /// refused with a warning and `Ok`. Admission is bounded by the global
    /// dispatch concurrency gate; excess deliveries wait here in arrival
    /// order until a slot frees up.
    #[instrument(skip(self))]
    pub async fn execute(&self, task_id: &str) -> EngineResult<()> {
        let Some(task) = self.load_task(task_id).await? else {
            warn!(task_id, "execute callback for unknown task");
            return Ok(());
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Queued) {
            warn!(task_id, status = task.status.as_str(), "refusing duplicate or late delivery");
            return Ok(());
        }

        // Held for the whole execution, including the repair loop.
        let _slot = self.dispatch_slots.acquire().await.map_err(|_| {
            EngineError::InternalInvariant {
                message: "dispatch admission gate closed".to_string(),
            }
        })?;

        self.store
            .update(
                TASK_COLLECTION,
                task_id,
                vec![
                    ("status".to_string(), FieldOp::Set(json!(TaskStatus::Running.as_str()))),
                    ("execution.started_at".to_string(), FieldOp::Set(server_timestamp())),
                ],
            )
            .await
            .map_err(store_err)?;

        // Cache coherence: a repaired script must be observed by this
        // execute, so the cached template is dropped before the reload.
        self.registry.invalidate_cache(&task.template_id);
        let template = self.registry.get_required(&task.template_id).await?;

        let envelope = self.build_envelope(&task, &template);
        let report = self
            .executor
            .execute(&template.execution_script, &task.parameters, &envelope)
            .await;

        let trajectory = Trajectory {
            task_id: task.task_id.clone(),
            template_id: template.template_id.clone(),
            parameters: task.parameters.clone(),
            steps: report.steps.clone(),
            outcome: match &report.result {
                Ok(_) => TrajectoryOutcome::Success,
                Err(e) => TrajectoryOutcome::Failure {
                    error_type: e.error_type().to_string(),
                    message: e.to_string(),
                    step: e.step().map(str::to_string),
                },
            },
            completed_at: Utc::now(),
            execution_time_ms: report.execution_time_ms,
            resource_usage: report.resource_usage.clone(),
        };

        match report.result {
            Ok(outcome) => {
                self.finish_success(&task, outcome, &trajectory).await?;
            }
            Err(error) => {
                self.finish_failure(&task, &template, error, &trajectory).await?;
            }
        }
        Ok(())
    }

    fn build_envelope(&self, task: &Task, template: &Template) -> CapabilityEnvelope {
        CapabilityEnvelope {
            data_source: GuardedDataSource::new(
                Arc::clone(&self.data_source),
                Arc::clone(&self.policy),
                Arc::clone(&self.rate_gate),
            ),
            llm: Arc::clone(&self.gateway),
            objects: Arc::clone(&self.objects),
            mirror: TaskStateMirror::new(Arc::clone(&self.store), TASK_COLLECTION, &task.task_id),
            logger: ScriptLogger::new(&task.task_id),
            meter: Arc::new(operon_sandbox::ResourceMeter::new()),
            limits: SandboxLimits::for_memory_tier(template.memory_tier_mb),
            user_id: task.user_id.clone(),
            template_id: Some(template.template_id.clone()),
        }
    }

    async fn finish_success(
        &self,
        task: &Task,
        outcome: operon_sandbox::ExecutionOutcome,
        trajectory: &Trajectory,
    ) -> EngineResult<()> {
        let result = json!({
            "summary": outcome.summary,
            "attachments": outcome.attachments,
            "execution_time_ms": trajectory.execution_time_ms,
            "resource_usage": trajectory.resource_usage,
        });
        self.store
            .update(
                TASK_COLLECTION,
                &task.task_id,
                vec![
                    ("status".to_string(), FieldOp::Set(json!(TaskStatus::Completed.as_str()))),
                    ("result".to_string(), FieldOp::Set(result)),
                    ("progress.percentage".to_string(), FieldOp::Set(json!(100))),
                ],
            )
            .await
            .map_err(store_err)?;
        info!(task_id = %task.task_id, "task completed");

        self.settle_attribution(&task.task_id, true).await;

        // Distillation is best-effort; a memory hiccup never fails the task.
        if let Err(error) = self.memory.extract_from_success(trajectory, None).await {
            warn!(%error, "success distillation failed");
        }
        Ok(())
    }

    async fn finish_failure(
        &self,
        task: &Task,
        template: &Template,
        error: EngineError,
        trajectory: &Trajectory,
    ) -> EngineResult<()> {
        let entry = TaskErrorEntry::from_error(&error);
        self.store
            .update(
                TASK_COLLECTION,
                &task.task_id,
                vec![(
                    "errors".to_string(),
                    FieldOp::ArrayUnion(vec![serde_json::to_value(&entry).map_err(internal)?]),
                )],
            )
            .await
            .map_err(store_err)?;

        self.settle_attribution(&task.task_id, false).await;

        if matches!(error, EngineError::Cancelled { .. }) {
            // cancel() already wrote the terminal status; cancellations are
            // never repaired or distilled as failures.
            info!(task_id = %task.task_id, "execution observed cancellation");
            return Ok(());
        }

        let repaired = if error.is_repair_eligible() {
            repair::run_repair_loop(self, task, template, &error, trajectory).await?
        } else {
            debug!(task_id = %task.task_id, error_type = error.error_type(), "error not repair-eligible");
            None
        };

        if repaired.is_none() {
            // Depth-capped origins are finalised inside the retry path with
            // their own terminal status; only plain failures land here.
            let still_open = self
                .load_task(&task.task_id)
                .await?
                .map(|t| !t.status.is_terminal())
                .unwrap_or(false);
            if still_open {
                self.store
                    .update(
                        TASK_COLLECTION,
                        &task.task_id,
                        vec![(
                            "status".to_string(),
                            FieldOp::Set(json!(TaskStatus::Failed.as_str())),
                        )],
                    )
                    .await
                    .map_err(store_err)?;
                info!(task_id = %task.task_id, "task failed");
            }
        }

        if let Err(distil_error) = self.memory.extract_from_failure(trajectory, None).await {
            warn!(%distil_error, "failure distillation failed");
        }
        Ok(())
    }

    async fn settle_attribution(&self, task_id: &str, success: bool) {
        if let Some((_, memory_ids)) = self.pending_attributions.remove(task_id) {
            if let Err(error) = self.memory.record_outcome(&memory_ids, success).await {
                warn!(%error, "memory attribution failed");
            }
        }
    }

    //─────────────────────────────
    //  Cancellation
    //─────────────────────────────

    /// Cooperatively cancel a task.
    ///
    /// Writes the terminal status, tries to delete the pending dispatch
    /// handle, and otherwise relies on the executor's checkpoint. A task
    /// already past its last checkpoint may still complete; that is not an
    /// error.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: &str, caller_id: &str) -> EngineResult<bool> {
        let Some(task) = self.load_task(task_id).await? else {
            warn!(task_id, caller_id, "cancel requested for unknown task");
            return Ok(false);
        };
        if task.status.is_terminal() {
            debug!(task_id, status = task.status.as_str(), "cancel on terminal task is a no-op");
            return Ok(false);
        }

        self.store
            .update(
                TASK_COLLECTION,
                task_id,
                vec![
                    ("status".to_string(), FieldOp::Set(json!(TaskStatus::Cancelled.as_str()))),
                    ("execution.cancelled_at".to_string(), FieldOp::Set(server_timestamp())),
                ],
            )
            .await
            .map_err(store_err)?;

        if let Some(handle) = &task.execution.dispatch_handle {
            let deleted = self
                .dispatch
                .cancel(&operon_store_core::DispatchHandle(handle.clone()))
                .await
                .unwrap_or(false);
            debug!(task_id, deleted, "dispatch handle cancellation attempted");
        }

        info!(task_id, caller_id, "task cancelled");
        Ok(true)
    }

    //─────────────────────────────
    //  Retry
    //─────────────────────────────

    /// Enqueue a retry for a repaired origin task.
    ///
    /// Returns `None` (without error) when the depth cap finalises the
    /// origin or a live retry already exists.
    pub async fn retry_with_repaired_template(
        &self,
        origin_task_id: &str,
        repaired_template_version: u32,
        original_error: &str,
        retrieved_memory_ids: Vec<String>,
        user_id: &str,
    ) -> EngineResult<Option<Task>> {
        let depth = task_id::retry_depth(origin_task_id);
        if depth >= task_id::MAX_RETRY_DEPTH {
            let error = EngineError::RepairExhausted {
                task_id: origin_task_id.to_string(),
                attempts: depth,
            };
            warn!(origin_task_id, depth, "retry depth exhausted, finalising origin");
            let entry = TaskErrorEntry::from_error(&error);
            self.store
                .update(
                    TASK_COLLECTION,
                    origin_task_id,
                    vec![
                        (
                            "status".to_string(),
                            FieldOp::Set(json!(TaskStatus::FailedMaxRetries.as_str())),
                        ),
                        ("final_retry_count".to_string(), FieldOp::Set(json!(depth))),
                        (
                            "failure_reason".to_string(),
                            FieldOp::Set(json!(format!("{error}: {original_error}"))),
                        ),
                        (
                            "errors".to_string(),
                            FieldOp::ArrayUnion(vec![serde_json::to_value(&entry)
                                .map_err(internal)?]),
                        ),
                    ],
                )
                .await
                .map_err(store_err)?;
            return Ok(None);
        }

        // Idempotency: at most one live retry per origin.
        let live_children = self
            .store
            .query(
                TASK_COLLECTION,
                Query::all().filter("parent_task_id", FilterOp::Eq, json!(origin_task_id)),
            )
            .await
            .map_err(store_err)?
            .into_iter()
            .filter(|(_, doc)| {
                matches!(
                    doc["status"].as_str(),
                    Some("pending") | Some("queued") | Some("running")
                )
            })
            .count();
        if live_children > 0 {
            debug!(origin_task_id, "live retry already exists, skipping creation");
            return Ok(None);
        }

        if user_id.trim().is_empty() {
            return Err(EngineError::InternalInvariant {
                message: format!("cannot resolve a user for retry of {origin_task_id}"),
            });
        }

        let Some(origin) = self.load_task(origin_task_id).await? else {
            return Err(EngineError::InternalInvariant {
                message: format!("retry requested for missing origin {origin_task_id}"),
            });
        };

        let attempt = depth + 1;
        let repair_info = AutoRepairInfo {
            original_error: original_error.to_string(),
            attempt,
            repaired_template_version,
            repaired_at: Utc::now(),
        };
        self.store
            .update(
                TASK_COLLECTION,
                origin_task_id,
                vec![
                    (
                        "status".to_string(),
                        FieldOp::Set(json!(TaskStatus::AutoRepaired.as_str())),
                    ),
                    (
                        "auto_repair_info".to_string(),
                        FieldOp::Set(serde_json::to_value(&repair_info).map_err(internal)?),
                    ),
                ],
            )
            .await
            .map_err(store_err)?;

        let mut retry = Task::new(
            task_id::retry_child(origin_task_id, attempt),
            origin.template_id.clone(),
            repaired_template_version,
            origin.parameters.clone(),
            user_id.to_string(),
        );
        retry.priority = origin.priority;
        // Repaired code is unproven; retries always run in testing mode.
        retry.testing = true;
        retry.parent_task_id = Some(origin_task_id.to_string());
        retry.retry_attempt = Some(attempt);
        retry.auto_repair_info = Some(repair_info);

        if !retrieved_memory_ids.is_empty() {
            self.pending_attributions
                .insert(retry.task_id.clone(), retrieved_memory_ids);
        }

        let retry = self.persist_and_enqueue(retry).await?;
        info!(origin_task_id, retry_task_id = %retry.task_id, attempt, "retry enqueued");
        Ok(Some(retry))
    }

    //─────────────────────────────
    //  Shared helpers
    //─────────────────────────────

    pub(crate) async fn load_task(&self, task_id: &str) -> EngineResult<Option<Task>> {
        let Some(doc) = self.store.get(TASK_COLLECTION, task_id).await.map_err(store_err)? else {
            return Ok(None);
        };
        serde_json::from_value(doc).map(Some).map_err(internal)
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub(crate) fn gateway(&self) -> &Arc<LlmGateway> {
        &self.gateway
    }

    pub(crate) fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }

    pub(crate) fn registry_arc(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    pub(crate) fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }
}

/// Pull the first JSON object out of a model response.
fn extract_json_object(response: &str) -> Option<Value> {
    let trimmed = response.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start >= end {
        return None;
    }
    let parsed: Value = serde_json::from_str(&trimmed[start..=end]).ok()?;
    parsed.is_object().then_some(parsed)
}

pub(crate) fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::UpstreamError { message: format!("store error: {e}"), step: None }
}

pub(crate) fn internal(e: serde_json::Error) -> EngineError {
    EngineError::InternalInvariant { message: format!("serialisation: {e}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_extraction_tolerates_prose() {
        let response = "Sure! Here you go:\n```json\n{\"limit\": 50}\n```";
        assert_eq!(extract_json_object(response), Some(json!({"limit": 50})));
        assert_eq!(extract_json_object("no object here"), None);
        assert_eq!(extract_json_object("[1, 2, 3]"), None);
    }
}
