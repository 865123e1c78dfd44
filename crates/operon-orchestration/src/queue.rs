//! Queue maintenance loops.
//!
//! A fast tick (default 5 s) publishes statistics and scans the pending
//! queue in dispatch order; a slow tick (default 60 s) deletes expired
//! tasks and crash-marks workers that missed their liveness window. Both
//! ticks are exposed as plain methods so tests can drive them directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use operon_store_core::{FieldOp, FilterOp, Query, SortDirection};
use operon_types::{EngineResult, Worker, WorkerStatus};

use crate::{store_err, Orchestrator, TASK_COLLECTION, WORKER_COLLECTION};

/// Default fast-tick period.
pub const FAST_TICK: Duration = Duration::from_secs(5);

/// Default slow-tick period.
pub const SLOW_TICK: Duration = Duration::from_secs(60);

/// A published queue statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    /// Tasks waiting for dispatch or callback.
    pub pending: usize,
    /// Tasks currently running.
    pub running: usize,
    /// Workers able to accept tasks.
    pub workers_available: usize,
    /// Free execution slots across available workers.
    pub free_slots: u32,
    /// When the snapshot was taken.
    pub published_at: Option<DateTime<Utc>>,
}

/// Owns the maintenance loops for one orchestrator.
pub struct QueueMaintenance {
    orchestrator: Arc<Orchestrator>,
    stats: Arc<RwLock<QueueStats>>,
}

impl QueueMaintenance {
    /// Maintenance bound to `orchestrator`.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator, stats: Arc::new(RwLock::new(QueueStats::default())) }
    }

    /// Latest published statistics.
    pub async fn stats(&self) -> QueueStats {
        self.stats.read().await.clone()
    }

    /// Spawn both loops with the default periods. The handles abort when
    /// dropped by the caller.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let fast = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(FAST_TICK);
                loop {
                    tick.tick().await;
                    if let Err(error) = this.run_fast_tick().await {
                        warn!(%error, "fast maintenance tick failed");
                    }
                }
            })
        };
        let slow = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(SLOW_TICK);
                loop {
                    tick.tick().await;
                    if let Err(error) = this.run_slow_tick().await {
                        warn!(%error, "slow maintenance tick failed");
                    }
                }
            })
        };
        (fast, slow)
    }

    /// Publish statistics and scan the pending queue in dispatch order
    /// (priority descending, then creation time ascending).
    pub async fn run_fast_tick(&self) -> EngineResult<()> {
        let store = self.orchestrator.store();

        let pending = store
            .query(
                TASK_COLLECTION,
                Query::all()
                    .filter("status", FilterOp::Eq, json!("pending"))
                    .order("priority", SortDirection::Desc)
                    .order("created_at", SortDirection::Asc),
            )
            .await
            .map_err(store_err)?;
        let queued = store
            .query(TASK_COLLECTION, Query::all().filter("status", FilterOp::Eq, json!("queued")))
            .await
            .map_err(store_err)?;
        let running = store
            .query(TASK_COLLECTION, Query::all().filter("status", FilterOp::Eq, json!("running")))
            .await
            .map_err(store_err)?;

        let workers = self.load_workers().await?;
        let available: Vec<&Worker> = workers.iter().filter(|w| w.status.accepts_tasks()).collect();
        let free_slots: u32 = available.iter().map(|w| w.free_slots()).sum();

        let snapshot = QueueStats {
            pending: pending.len() + queued.len(),
            running: running.len(),
            workers_available: available.len(),
            free_slots,
            published_at: Some(Utc::now()),
        };
        debug!(
            pending = snapshot.pending,
            running = snapshot.running,
            workers = snapshot.workers_available,
            free_slots = snapshot.free_slots,
            "queue statistics"
        );
        *self.stats.write().await = snapshot;
        Ok(())
    }

    /// Delete expired tasks and crash-mark stale workers.
    pub async fn run_slow_tick(&self) -> EngineResult<()> {
        let store = self.orchestrator.store();
        let now = Utc::now();

        let rows = store
            .query(
                TASK_COLLECTION,
                Query::all().filter("expires_at", FilterOp::Lt, json!(now)),
            )
            .await
            .map_err(store_err)?;
        for (id, _) in &rows {
            info!(task_id = %id, "deleting expired task");
            store.delete(TASK_COLLECTION, id).await.map_err(store_err)?;
        }

        for worker in self.load_workers().await? {
            if worker.status != WorkerStatus::Crashed && worker.is_stale(now) {
                warn!(worker_id = %worker.worker_id, "worker missed liveness window, marking crashed");
                store
                    .update(
                        WORKER_COLLECTION,
                        &worker.worker_id,
                        vec![("status".to_string(), FieldOp::Set(json!("crashed")))],
                    )
                    .await
                    .map_err(store_err)?;
            }
        }
        Ok(())
    }

    async fn load_workers(&self) -> EngineResult<Vec<Worker>> {
        let rows = self
            .orchestrator
            .store()
            .query(WORKER_COLLECTION, Query::all())
            .await
            .map_err(store_err)?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, doc)| match serde_json::from_value::<Worker>(doc) {
                Ok(worker) => Some(worker),
                Err(error) => {
                    warn!(worker_id = %id, %error, "unreadable worker document");
                    None
                }
            })
            .collect())
    }
}
