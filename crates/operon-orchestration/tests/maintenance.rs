//! Queue maintenance loop tests: statistics, expiry, worker liveness.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use operon_llm_gateway::testing::ScriptedProvider;
use operon_llm_gateway::LlmGateway;
use operon_orchestration::{
    Orchestrator, QueueMaintenance, TASK_COLLECTION, WORKER_COLLECTION,
};
use operon_reasoning::MemoryService;
use operon_registry::TemplateRegistry;
use operon_sandbox::{DataSourceProvider, ScriptPolicy};
use operon_store_core::{DeferredDispatch, DocumentStore, ObjectStore, VectorIndex};
use operon_store_memory::{
    MemoryDispatcher, MemoryDocumentStore, MemoryObjectStore, MemoryVectorIndex,
};
use operon_types::{EngineResult, Task, Worker, WorkerStatus};

struct NullCrm;

#[async_trait::async_trait]
impl DataSourceProvider for NullCrm {
    async fn call(&self, _m: &str, _p: &serde_json::Value) -> EngineResult<serde_json::Value> {
        Ok(json!([]))
    }
}

async fn fixture() -> (Arc<Orchestrator>, Arc<MemoryDocumentStore>, QueueMaintenance) {
    let provider = Arc::new(ScriptedProvider::new());
    let gateway = Arc::new(LlmGateway::new(
        Arc::clone(&provider) as Arc<dyn operon_llm_gateway::LlmProvider>
    ));
    let store = Arc::new(MemoryDocumentStore::new());
    let index = Arc::new(MemoryVectorIndex::new());
    let policy = Arc::new(ScriptPolicy::new());

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store) as Arc<dyn DocumentStore>,
        Arc::new(MemoryDispatcher::new()) as Arc<dyn DeferredDispatch>,
        Arc::new(MemoryObjectStore::new()) as Arc<dyn ObjectStore>,
        Arc::new(NullCrm),
        Arc::clone(&gateway),
        Arc::new(TemplateRegistry::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&index) as Arc<dyn VectorIndex>,
            Arc::clone(&gateway),
        )),
        Arc::new(MemoryService::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&index) as Arc<dyn VectorIndex>,
            gateway,
            policy,
        )),
    ));
    let maintenance = QueueMaintenance::new(Arc::clone(&orchestrator));
    (orchestrator, store, maintenance)
}

fn seed_task(id: &str, status: &str, priority: u8) -> serde_json::Value {
    let mut task = Task::new(
        id.to_string(),
        "tmpl-1".to_string(),
        1,
        json!({}),
        "user-1".to_string(),
    );
    task.priority = priority;
    let mut doc = serde_json::to_value(&task).unwrap();
    doc["status"] = json!(status);
    doc
}

#[tokio::test]
async fn fast_tick_publishes_queue_statistics() {
    let (_orchestrator, store, maintenance) = fixture().await;

    store.put(TASK_COLLECTION, "a", seed_task("task_1_aaa", "pending", 80)).await.unwrap();
    store.put(TASK_COLLECTION, "b", seed_task("task_2_bbb", "pending", 20)).await.unwrap();
    store.put(TASK_COLLECTION, "c", seed_task("task_3_ccc", "running", 50)).await.unwrap();
    store.put(TASK_COLLECTION, "d", seed_task("task_4_ddd", "completed", 50)).await.unwrap();

    let worker = Worker {
        worker_id: "w1".to_string(),
        status: WorkerStatus::Idle,
        current_tasks: vec![],
        last_heartbeat: Utc::now(),
        max_concurrent_tasks: 2,
        specializations: vec![],
    };
    store
        .put(WORKER_COLLECTION, "w1", serde_json::to_value(&worker).unwrap())
        .await
        .unwrap();

    maintenance.run_fast_tick().await.unwrap();
    let stats = maintenance.stats().await;
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.workers_available, 1);
    assert_eq!(stats.free_slots, 2);
    assert!(stats.published_at.is_some());
}

#[tokio::test]
async fn slow_tick_deletes_expired_tasks() {
    let (_orchestrator, store, maintenance) = fixture().await;

    let mut expired = Task::new(
        "task_1_expired".to_string(),
        "tmpl-1".to_string(),
        1,
        json!({}),
        "user-1".to_string(),
    );
    expired.expires_at = Utc::now() - ChronoDuration::days(1);
    store
        .put(TASK_COLLECTION, "task_1_expired", serde_json::to_value(&expired).unwrap())
        .await
        .unwrap();
    store.put(TASK_COLLECTION, "task_2_live", seed_task("task_2_live", "pending", 50)).await.unwrap();

    maintenance.run_slow_tick().await.unwrap();

    assert!(store.get(TASK_COLLECTION, "task_1_expired").await.unwrap().is_none());
    assert!(store.get(TASK_COLLECTION, "task_2_live").await.unwrap().is_some());
}

#[tokio::test]
async fn slow_tick_crashes_stale_workers() {
    let (_orchestrator, store, maintenance) = fixture().await;

    let stale = Worker {
        worker_id: "w-stale".to_string(),
        status: WorkerStatus::Running,
        current_tasks: vec!["task_1_x".to_string()],
        last_heartbeat: Utc::now() - ChronoDuration::minutes(11),
        max_concurrent_tasks: 2,
        specializations: vec![],
    };
    let fresh = Worker {
        worker_id: "w-fresh".to_string(),
        status: WorkerStatus::Idle,
        current_tasks: vec![],
        last_heartbeat: Utc::now(),
        max_concurrent_tasks: 2,
        specializations: vec![],
    };
    for worker in [&stale, &fresh] {
        store
            .put(WORKER_COLLECTION, &worker.worker_id, serde_json::to_value(worker).unwrap())
            .await
            .unwrap();
    }

    maintenance.run_slow_tick().await.unwrap();

    let doc = store.get(WORKER_COLLECTION, "w-stale").await.unwrap().unwrap();
    assert_eq!(doc["status"], "crashed");
    let doc = store.get(WORKER_COLLECTION, "w-fresh").await.unwrap().unwrap();
    assert_eq!(doc["status"], "idle");
}
