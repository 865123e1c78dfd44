//! The capability envelope injected into sandboxed scripts.
//!
//! Scripts cannot reach outside this envelope: a guarded data source, a
//! bounded LLM handle, a structured logger, a progress sink, and the
//! cooperative cancellation probe. Every guard runs *before* the underlying
//! call is made.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use operon_llm_gateway::LlmGateway;
use operon_store_core::{server_timestamp, DocumentStore, FieldOp, ObjectStore};
use operon_types::{EngineError, EngineResult, TaskStatus};

use crate::limits::{ResourceMeter, SandboxLimits};
use crate::policy::ScriptPolicy;
use crate::rategate::RateGate;
use crate::{MAX_BATCH_COMMANDS, MAX_LIST_ROWS, MAX_PARAM_PAYLOAD_BYTES};

/// Method-addressed RPC against the primary external data source.
///
/// Implementations classify their own failures: a throttling response maps
/// to [`EngineError::UpstreamQuota`], an outage to
/// [`EngineError::UpstreamUnavailable`], anything else to
/// [`EngineError::UpstreamError`].
#[async_trait]
pub trait DataSourceProvider: Send + Sync {
    /// Invoke `method` with `params` and return the provider payload.
    async fn call(&self, method: &str, params: &Value) -> EngineResult<Value>;
}

/// Policy-enforcing wrapper around a [`DataSourceProvider`].
///
/// Refusals raised here never reach the provider; that is the property the
/// test suite pins down for dangerous methods and over-limit list calls.
pub struct GuardedDataSource {
    provider: Arc<dyn DataSourceProvider>,
    policy: Arc<ScriptPolicy>,
    gate: Arc<RateGate>,
}

impl GuardedDataSource {
    /// Wrap `provider` with the given policy and rate gate.
    pub fn new(
        provider: Arc<dyn DataSourceProvider>,
        policy: Arc<ScriptPolicy>,
        gate: Arc<RateGate>,
    ) -> Self {
        Self { provider, policy, gate }
    }

    /// Validate and dispatch one call.
    pub async fn call(&self, method: &str, params: &Value) -> EngineResult<Value> {
        self.policy.check_method(method)?;
        check_call_shape(method, params)?;

        self.gate.acquire().await?;
        debug!(method, "dispatching data source call");
        let result = self.provider.call(method, params).await;
        if matches!(result, Err(EngineError::UpstreamQuota { .. })) {
            self.gate.note_upstream_throttle();
        }
        result
    }
}

/// Shape rules applied to every call before dispatch: list calls need a
/// filter and a sane row cap, batches are bounded, payloads are bounded.
fn check_call_shape(method: &str, params: &Value) -> EngineResult<()> {
    let payload_len = serde_json::to_string(params).map(|s| s.len()).unwrap_or(usize::MAX);
    if payload_len > MAX_PARAM_PAYLOAD_BYTES {
        return Err(EngineError::CapabilityRefused {
            method: method.to_string(),
            reason: format!("parameter payload {payload_len}B exceeds {MAX_PARAM_PAYLOAD_BYTES}B"),
        });
    }

    if method.ends_with(".list") {
        if params.get("filter").is_none() {
            return Err(EngineError::CapabilityRefused {
                method: method.to_string(),
                reason: "list calls must include a filter parameter".to_string(),
            });
        }
        if let Some(limit) = params.get("limit").and_then(Value::as_u64) {
            if limit > MAX_LIST_ROWS {
                return Err(EngineError::CapabilityRefused {
                    method: method.to_string(),
                    reason: format!("requested {limit} rows, cap is {MAX_LIST_ROWS}"),
                });
            }
        }
    }

    if let Some(commands) = params.get("commands").and_then(Value::as_array) {
        if commands.len() > MAX_BATCH_COMMANDS {
            return Err(EngineError::CapabilityRefused {
                method: method.to_string(),
                reason: format!(
                    "batch carries {} sub-commands, cap is {MAX_BATCH_COMMANDS}",
                    commands.len()
                ),
            });
        }
    }

    Ok(())
}

/// The task-document mirror: progress writes and the cancellation probe.
///
/// Progress uses field-level updates so executor writes never clobber the
/// orchestrator's concurrent bookkeeping on the same document.
pub struct TaskStateMirror {
    store: Arc<dyn DocumentStore>,
    collection: String,
    task_id: String,
}

impl TaskStateMirror {
    /// Mirror for `task_id` in `collection`.
    pub fn new(store: Arc<dyn DocumentStore>, collection: &str, task_id: &str) -> Self {
        Self { store, collection: collection.to_string(), task_id: task_id.to_string() }
    }

    /// Task id this mirror serves.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Write a progress update and heartbeat.
    pub async fn report_progress(&self, percentage: u8, message: Option<&str>) -> EngineResult<()> {
        let mut ops = vec![
            (
                "progress.percentage".to_string(),
                FieldOp::Set(Value::from(percentage.min(100))),
            ),
            ("progress.last_heartbeat".to_string(), FieldOp::Set(server_timestamp())),
        ];
        if let Some(message) = message {
            ops.push(("progress.message".to_string(), FieldOp::Set(Value::from(message))));
        }
        self.store
            .update(&self.collection, &self.task_id, ops)
            .await
            .map_err(|e| EngineError::InternalInvariant {
                message: format!("progress write failed: {e}"),
            })
    }

    /// Cooperative checkpoint: raise `Cancelled` when the store says so.
    pub async fn checkpoint(&self, step: Option<&str>) -> EngineResult<()> {
        let doc = self
            .store
            .get(&self.collection, &self.task_id)
            .await
            .map_err(|e| EngineError::InternalInvariant {
                message: format!("cancellation probe failed: {e}"),
            })?;
        let cancelled = doc
            .as_ref()
            .and_then(|d| d.get("status"))
            .and_then(Value::as_str)
            .is_some_and(|s| s == TaskStatus::Cancelled.as_str());
        if cancelled {
            info!(task_id = %self.task_id, "cancellation observed at checkpoint");
            return Err(EngineError::Cancelled { step: step.map(str::to_string) });
        }
        Ok(())
    }
}

/// Structured logger scripts may write to. Entries land in the process
/// trace stream; there is no side channel back to the script author.
#[derive(Debug, Default)]
pub struct ScriptLogger {
    task_id: String,
}

impl ScriptLogger {
    /// Logger tagged with the owning task.
    pub fn new(task_id: &str) -> Self {
        Self { task_id: task_id.to_string() }
    }

    /// Log an informational message.
    pub fn info(&self, message: &str) {
        info!(task_id = %self.task_id, "{message}");
    }

    /// Log a warning.
    pub fn warn(&self, message: &str) {
        warn!(task_id = %self.task_id, "{message}");
    }
}

/// Everything a script execution may touch.
pub struct CapabilityEnvelope {
    /// Guarded primary data source.
    pub data_source: GuardedDataSource,
    /// Gateway for bounded in-script generation.
    pub llm: Arc<LlmGateway>,
    /// Object store for emitted artefacts.
    pub objects: Arc<dyn ObjectStore>,
    /// Task-document mirror (progress + cancellation).
    pub mirror: TaskStateMirror,
    /// Structured logger.
    pub logger: ScriptLogger,
    /// Usage meter shared with the executor.
    pub meter: Arc<ResourceMeter>,
    /// Limits the execution runs under.
    pub limits: SandboxLimits,
    /// User the task runs on behalf of; stamped onto artefact metadata.
    pub user_id: String,
    /// Template the task instantiates; stamped onto artefact metadata.
    pub template_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_store_memory::MemoryDocumentStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DataSourceProvider for CountingProvider {
        async fn call(&self, _method: &str, _params: &Value) -> EngineResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"result": []}))
        }
    }

    fn guarded(provider: Arc<CountingProvider>) -> GuardedDataSource {
        GuardedDataSource::new(provider, Arc::new(ScriptPolicy::new()), Arc::new(RateGate::new()))
    }

    #[tokio::test]
    async fn dangerous_methods_never_reach_the_provider() {
        let provider = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let ds = guarded(Arc::clone(&provider));

        let err = ds.call("crm.user.admin", &json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::CapabilityRefused { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn list_calls_require_filter_and_row_cap() {
        let provider = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let ds = guarded(Arc::clone(&provider));

        let err = ds.call("crm.invoice.list", &json!({"limit": 10})).await.unwrap_err();
        assert!(err.to_string().contains("filter"));

        let err = ds
            .call("crm.invoice.list", &json!({"filter": {}, "limit": 501}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cap is 500"));

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        ds.call("crm.invoice.list", &json!({"filter": {"STATUS": "P"}, "limit": 500}))
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batches_are_bounded() {
        let provider = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let ds = guarded(Arc::clone(&provider));

        let commands: Vec<Value> = (0..51).map(|i| json!({"cmd": i})).collect();
        let err = ds.call("batch", &json!({"commands": commands})).await.unwrap_err();
        assert!(err.to_string().contains("sub-commands"));
    }

    #[tokio::test]
    async fn oversized_payloads_are_refused() {
        let provider = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let ds = guarded(Arc::clone(&provider));

        let big = "x".repeat(MAX_PARAM_PAYLOAD_BYTES + 1);
        let err = ds
            .call("crm.invoice.get", &json!({"blob": big}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("payload"));
    }

    #[tokio::test]
    async fn checkpoint_observes_store_cancellation() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .put("tasks", "t1", json!({"status": "running", "progress": {"percentage": 0}}))
            .await
            .unwrap();
        let mirror = TaskStateMirror::new(store.clone() as Arc<dyn DocumentStore>, "tasks", "t1");

        mirror.checkpoint(None).await.unwrap();
        mirror.report_progress(40, Some("halfway")).await.unwrap();

        store
            .update("tasks", "t1", vec![("status".into(), FieldOp::Set(json!("cancelled")))])
            .await
            .unwrap();
        let err = mirror.checkpoint(Some("crm.invoice.list")).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));

        let doc = store.get("tasks", "t1").await.unwrap().unwrap();
        assert_eq!(doc["progress"]["percentage"], 40);
        assert_eq!(doc["progress"]["message"], "halfway");
    }
}
