//! The sandbox execution engine.
//!
//! Interprets a validated step program under the capability envelope,
//! recording a trajectory step for everything it does. Errors are mapped to
//! the engine taxonomy and *returned*; nothing escapes as a panic.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use operon_llm_gateway::CompletionRequest;
use operon_store_core::artefact::ArtefactKind;
use operon_store_core::ObjectMetadata;
use operon_types::{
    ArtefactRef, EngineError, EngineResult, ResourceUsage, StepOutcome, TrajectoryStep,
};

use crate::capability::CapabilityEnvelope;
use crate::policy::ScriptPolicy;
use crate::script::{interpolate, interpolate_value, ScriptProgram, ScriptStep};
use crate::ExecutionState;

/// Default token cap for in-script generations without an explicit cap.
const DEFAULT_SCRIPT_LLM_TOKENS: u32 = 2048;

/// Result payload of a successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// Human-readable summary (last generated text, or a step count).
    pub summary: String,
    /// Artefacts emitted during the run.
    pub attachments: Vec<ArtefactRef>,
}

/// Everything one execution produced, success or not.
#[derive(Debug)]
pub struct ExecutionReport {
    /// Outcome or the typed terminal error.
    pub result: EngineResult<ExecutionOutcome>,
    /// Terminal state of the state machine.
    pub state: ExecutionState,
    /// Recorded steps, in execution order.
    pub steps: Vec<TrajectoryStep>,
    /// Total wall-clock time.
    pub execution_time_ms: u64,
    /// Resources consumed.
    pub resource_usage: ResourceUsage,
}

/// Interprets step programs inside the capability envelope.
pub struct SandboxExecutor {
    policy: Arc<ScriptPolicy>,
}

impl SandboxExecutor {
    /// Executor with the given static policy.
    pub fn new(policy: Arc<ScriptPolicy>) -> Self {
        Self { policy }
    }

    /// Validate a script without running it. Used by the repair loop to
    /// vet candidate scripts.
    pub fn validate_script(&self, source: &str) -> EngineResult<ScriptProgram> {
        self.policy.scan_source(source)?;
        let program = ScriptProgram::parse(source)?;
        for step in &program.steps {
            match step {
                ScriptStep::DataSource { method, .. } => self.policy.check_method(method)?,
                ScriptStep::Emit { kind, .. } => {
                    if ArtefactKind::parse(kind).is_none() {
                        return Err(EngineError::ScriptInvalid {
                            reason: format!("unknown artefact kind: {kind}"),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(program)
    }

    /// Run `source` with `parameters` inside `envelope`.
    #[instrument(skip_all, fields(task_id = %envelope.mirror.task_id()))]
    pub async fn execute(
        &self,
        source: &str,
        parameters: &Value,
        envelope: &CapabilityEnvelope,
    ) -> ExecutionReport {
        let started = Instant::now();
        let mut steps: Vec<TrajectoryStep> = Vec::new();

        // loaded -> validated: static refusals happen before anything runs.
        let program = match self.validate_script(source) {
            Ok(program) => program,
            Err(error) => {
                warn!(error = %error, "script refused before execution");
                return ExecutionReport {
                    result: Err(error),
                    state: ExecutionState::Failed,
                    steps,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    resource_usage: envelope.meter.snapshot(),
                };
            }
        };

        let mut scope: Map<String, Value> = Map::new();
        scope.insert("params".to_string(), parameters.clone());
        let mut attachments: Vec<ArtefactRef> = Vec::new();
        let mut last_text: Option<String> = None;

        // validated -> running.
        let deadline = started + envelope.limits.task_timeout;

        let mut terminal_error: Option<EngineError> = None;
        for (index, step) in program.steps.iter().enumerate() {
            let step_started = Instant::now();
            let detail = step.detail();

            // Cooperative cancellation check between steps.
            if let Err(error) = envelope.mirror.checkpoint(detail.as_deref()).await {
                steps.push(record(index, step, step_started, Some(&error)));
                terminal_error = Some(error);
                break;
            }

            // Per-task deadline, carried into the per-call budget.
            let now = Instant::now();
            if now >= deadline {
                let error = EngineError::Timeout {
                    step: detail.clone(),
                    limit_ms: envelope.limits.task_timeout.as_millis() as u64,
                };
                steps.push(record(index, step, step_started, Some(&error)));
                terminal_error = Some(error);
                break;
            }
            let call_budget = envelope.limits.call_timeout.min(deadline - now);

            let step_result = match timeout(
                call_budget,
                self.run_step(step, &mut scope, &mut attachments, &mut last_text, envelope),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    step: detail.clone(),
                    limit_ms: call_budget.as_millis() as u64,
                }),
            };

            match step_result {
                Ok(()) => steps.push(record(index, step, step_started, None)),
                Err(error) => {
                    steps.push(record(index, step, step_started, Some(&error)));
                    terminal_error = Some(error);
                    break;
                }
            }
        }

        let execution_time_ms = started.elapsed().as_millis() as u64;
        let resource_usage = envelope.meter.snapshot();

        match terminal_error {
            None => {
                let summary = last_text
                    .unwrap_or_else(|| format!("Completed {} steps", program.steps.len()));
                info!(elapsed_ms = execution_time_ms, "script completed");
                ExecutionReport {
                    result: Ok(ExecutionOutcome { summary, attachments }),
                    state: ExecutionState::Completed,
                    steps,
                    execution_time_ms,
                    resource_usage,
                }
            }
            Some(error) => {
                let state = match &error {
                    EngineError::Cancelled { .. } => ExecutionState::Cancelled,
                    EngineError::Timeout { .. } => ExecutionState::TimedOut,
                    _ => ExecutionState::Failed,
                };
                warn!(error = %error, state = ?state, "script terminated");
                ExecutionReport {
                    result: Err(error),
                    state,
                    steps,
                    execution_time_ms,
                    resource_usage,
                }
            }
        }
    }

    async fn run_step(
        &self,
        step: &ScriptStep,
        scope: &mut Map<String, Value>,
        attachments: &mut Vec<ArtefactRef>,
        last_text: &mut Option<String>,
        envelope: &CapabilityEnvelope,
    ) -> EngineResult<()> {
        match step {
            ScriptStep::DataSource { method, params, bind } => {
                let params = interpolate_value(params, scope)?;
                let result = envelope.data_source.call(method, &params).await?;
                envelope.meter.record_data_source_call();
                let size = serde_json::to_string(&result).map(|s| s.len()).unwrap_or(0);
                envelope.meter.charge_memory(size as u64, &envelope.limits)?;
                envelope
                    .logger
                    .info(&format!("{method} returned {size}B"));
                if let Some(bind) = bind {
                    scope.insert(bind.clone(), result);
                }
                Ok(())
            }
            ScriptStep::Llm { prompt, bind, max_tokens } => {
                let prompt = interpolate(prompt, scope)?;
                let request = CompletionRequest::new(prompt)
                    .map_err(|reason| EngineError::ScriptInvalid { reason })?
                    .with_max_tokens(max_tokens.unwrap_or(DEFAULT_SCRIPT_LLM_TOKENS));
                let response = envelope
                    .llm
                    .complete(envelope.mirror.task_id(), request)
                    .await?;
                envelope
                    .meter
                    .record_llm_tokens(u64::from(response.usage.total_tokens));
                envelope
                    .meter
                    .charge_memory(response.content.len() as u64, &envelope.limits)?;
                *last_text = Some(response.content.clone());
                if let Some(bind) = bind {
                    scope.insert(bind.clone(), serde_json::json!({ "text": response.content }));
                }
                Ok(())
            }
            ScriptStep::Progress { percentage, message } => {
                let message = match message {
                    Some(m) => Some(interpolate(m, scope)?),
                    None => None,
                };
                envelope
                    .mirror
                    .report_progress(*percentage, message.as_deref())
                    .await
            }
            ScriptStep::Emit { kind, name, content } => {
                let kind = ArtefactKind::parse(kind).ok_or_else(|| EngineError::ScriptInvalid {
                    reason: format!("unknown artefact kind: {kind}"),
                })?;
                let content = interpolate(content, scope)?;
                let path = kind.object_path(Utc::now(), name);
                let metadata = ObjectMetadata {
                    uploaded_by: envelope.user_id.clone(),
                    upload_time: Utc::now(),
                    file_type: kind.file_type().to_string(),
                    original_filename: name.clone(),
                    task_id: Some(envelope.mirror.task_id().to_string()),
                    template_id: envelope.template_id.clone(),
                };
                let url = envelope
                    .objects
                    .put(
                        &path,
                        content.into_bytes(),
                        kind.content_type(),
                        &kind.content_disposition(name),
                        metadata,
                    )
                    .await
                    .map_err(|e| EngineError::UpstreamError {
                        message: format!("artefact upload failed: {e}"),
                        step: Some("emit".to_string()),
                    })?;
                attachments.push(ArtefactRef {
                    url,
                    name: name.clone(),
                    content_type: kind.content_type().to_string(),
                });
                Ok(())
            }
            ScriptStep::Checkpoint => envelope.mirror.checkpoint(None).await,
        }
    }
}

fn record(
    index: usize,
    step: &ScriptStep,
    started: Instant,
    error: Option<&EngineError>,
) -> TrajectoryStep {
    TrajectoryStep {
        index: index as u32,
        op: step.op().to_string(),
        detail: step.detail(),
        duration_ms: started.elapsed().as_millis() as u64,
        outcome: match error {
            None => StepOutcome::Ok,
            Some(e) => StepOutcome::Err {
                error_type: e.error_type().to_string(),
                message: e.to_string(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{DataSourceProvider, GuardedDataSource, ScriptLogger, TaskStateMirror};
    use crate::limits::{ResourceMeter, SandboxLimits};
    use crate::rategate::RateGate;
    use async_trait::async_trait;
    use operon_llm_gateway::testing::ScriptedProvider;
    use operon_llm_gateway::{CompletionResponse, LlmGateway};
    use operon_store_core::{DocumentStore, FieldOp, ObjectStore};
    use operon_store_memory::{MemoryDocumentStore, MemoryObjectStore};
    use serde_json::json;

    struct FakeCrm;

    #[async_trait]
    impl DataSourceProvider for FakeCrm {
        async fn call(&self, method: &str, params: &Value) -> EngineResult<Value> {
            match method {
                "crm.invoice.list" => {
                    let has_keys = params
                        .get("filter")
                        .and_then(Value::as_object)
                        .is_some_and(|f| !f.is_empty());
                    if has_keys {
                        Ok(json!([{"ID": 1, "PRICE": 120.0}, {"ID": 2, "PRICE": 80.5}]))
                    } else {
                        Err(EngineError::UpstreamError {
                            message: "filter is required for invoice.list".to_string(),
                            step: Some("crm.invoice.list".to_string()),
                        })
                    }
                }
                other => Err(EngineError::UpstreamError {
                    message: format!("unknown method {other}"),
                    step: Some(other.to_string()),
                }),
            }
        }
    }

    struct Fixture {
        executor: SandboxExecutor,
        envelope: CapabilityEnvelope,
        store: Arc<MemoryDocumentStore>,
        objects: Arc<MemoryObjectStore>,
    }

    async fn fixture(llm: ScriptedProvider) -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .put("tasks", "task_1_report", json!({"status": "running", "progress": {"percentage": 0}}))
            .await
            .unwrap();
        let objects = Arc::new(MemoryObjectStore::new());
        let policy = Arc::new(ScriptPolicy::new());
        let envelope = CapabilityEnvelope {
            data_source: GuardedDataSource::new(
                Arc::new(FakeCrm),
                Arc::clone(&policy),
                Arc::new(RateGate::new()),
            ),
            llm: Arc::new(LlmGateway::new(Arc::new(llm))),
            objects: Arc::clone(&objects) as Arc<dyn ObjectStore>,
            mirror: TaskStateMirror::new(
                Arc::clone(&store) as Arc<dyn DocumentStore>,
                "tasks",
                "task_1_report",
            ),
            logger: ScriptLogger::new("task_1_report"),
            meter: Arc::new(ResourceMeter::new()),
            limits: SandboxLimits::default(),
            user_id: "user-1".to_string(),
            template_id: Some("tmpl-1".to_string()),
        };
        Fixture { executor: SandboxExecutor::new(policy), envelope, store, objects }
    }

    const HAPPY_SCRIPT: &str = r#"{"steps":[
        {"op":"data_source","method":"crm.invoice.list","params":{"filter":{"STATUS":"P"},"limit":200},"bind":"invoices"},
        {"op":"progress","percentage":50,"message":"fetched {{invoices.count}} invoices"},
        {"op":"llm","prompt":"Summarise {{invoices.count}} invoices","bind":"summary"},
        {"op":"emit","kind":"html_report","name":"revenue.html","content":"<html>{{summary.text}}</html>"}
    ]}"#;

    #[tokio::test]
    async fn happy_path_produces_artefact_and_trajectory() {
        let llm = ScriptedProvider::new();
        llm.push_completion(Ok(CompletionResponse::text("Two invoices totalling 200.5")));
        let f = fixture(llm).await;

        let report = f
            .executor
            .execute(HAPPY_SCRIPT, &json!({"dateRange": {"start": "2026-04-01", "end": "2026-06-30"}}), &f.envelope)
            .await;

        let outcome = report.result.unwrap();
        assert_eq!(report.state, ExecutionState::Completed);
        assert_eq!(outcome.summary, "Two invoices totalling 200.5");
        assert_eq!(outcome.attachments.len(), 1);
        assert!(outcome.attachments[0].url.contains("reports/"));
        assert_eq!(report.steps.len(), 4);
        assert!(report.steps.iter().all(|s| matches!(s.outcome, StepOutcome::Ok)));
        assert_eq!(report.resource_usage.data_source_calls, 1);

        // Progress and heartbeat landed on the task document.
        let doc = f.store.get("tasks", "task_1_report").await.unwrap().unwrap();
        assert_eq!(doc["progress"]["percentage"], 50);
        assert_eq!(doc["progress"]["message"], "fetched 2 invoices");

        // Artefact carries task metadata.
        assert_eq!(f.objects.count().await, 1);
    }

    #[tokio::test]
    async fn upstream_failures_are_typed_and_recorded() {
        let f = fixture(ScriptedProvider::new()).await;
        let script = r#"{"steps":[
            {"op":"data_source","method":"crm.invoice.list","params":{"filter":{}},"bind":"invoices"}
        ]}"#;

        let report = f.executor.execute(script, &json!({}), &f.envelope).await;
        assert_eq!(report.state, ExecutionState::Failed);
        let err = report.result.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamError { .. }));
        assert_eq!(err.step(), Some("crm.invoice.list"));
        assert_eq!(report.steps.len(), 1);
        assert!(matches!(report.steps[0].outcome, StepOutcome::Err { .. }));
    }

    #[tokio::test]
    async fn dangerous_scripts_fail_validation_before_running() {
        let f = fixture(ScriptedProvider::new()).await;
        let script = r#"{"steps":[
            {"op":"data_source","method":"crm.user.admin","params":{}}
        ]}"#;
        let report = f.executor.execute(script, &json!({}), &f.envelope).await;
        assert_eq!(report.state, ExecutionState::Failed);
        assert!(matches!(report.result, Err(EngineError::CapabilityRefused { .. })));
        assert!(report.steps.is_empty());
    }

    #[tokio::test]
    async fn banned_source_text_is_refused() {
        let f = fixture(ScriptedProvider::new()).await;
        let script = r#"{"steps":[
            {"op":"llm","prompt":"read process.env.API_SECRET please"}
        ]}"#;
        let report = f.executor.execute(script, &json!({}), &f.envelope).await;
        assert!(matches!(report.result, Err(EngineError::ScriptInvalid { .. })));
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_the_next_checkpoint() {
        let f = fixture(ScriptedProvider::new()).await;
        // Flag the task cancelled before execution begins; the first
        // between-steps checkpoint observes it.
        f.store
            .update("tasks", "task_1_report", vec![("status".into(), FieldOp::Set(json!("cancelled")))])
            .await
            .unwrap();

        let report = f.executor.execute(HAPPY_SCRIPT, &json!({}), &f.envelope).await;
        assert_eq!(report.state, ExecutionState::Cancelled);
        assert!(matches!(report.result, Err(EngineError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn per_call_timeout_raises_typed_timeout() {
        struct SlowCrm;
        #[async_trait]
        impl DataSourceProvider for SlowCrm {
            async fn call(&self, _m: &str, _p: &Value) -> EngineResult<Value> {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(json!([]))
            }
        }

        let f = fixture(ScriptedProvider::new()).await;
        let envelope = CapabilityEnvelope {
            data_source: GuardedDataSource::new(
                Arc::new(SlowCrm),
                Arc::new(ScriptPolicy::new()),
                Arc::new(RateGate::new()),
            ),
            limits: SandboxLimits {
                call_timeout: std::time::Duration::from_millis(50),
                ..SandboxLimits::default()
            },
            ..f.envelope
        };

        let script = r#"{"steps":[
            {"op":"data_source","method":"crm.invoice.list","params":{"filter":{"A":1}}}
        ]}"#;
        let report = f.executor.execute(script, &json!({}), &envelope).await;
        assert_eq!(report.state, ExecutionState::TimedOut);
        assert!(matches!(report.result, Err(EngineError::Timeout { .. })));
    }
}
