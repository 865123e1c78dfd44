//! Worker entity: the interface-relevant slice of the externalised worker
//! registry the queue maintenance loop consults.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Liveness window after which a silent worker is considered crashed.
pub const WORKER_LIVENESS_WINDOW_SECS: i64 = 600;

/// Default per-worker task capacity.
pub const DEFAULT_MAX_CONCURRENT_TASKS: u32 = 2;

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Booting; not yet accepting tasks.
    Starting,
    /// Actively executing at least one task.
    Running,
    /// Alive with free capacity.
    Idle,
    /// Draining before shutdown.
    Stopping,
    /// Cleanly stopped.
    Stopped,
    /// Missed its liveness window; tasks it held are orphaned.
    Crashed,
}

impl WorkerStatus {
    /// Whether a worker in this status can accept new tasks.
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, Self::Running | Self::Idle)
    }
}

/// A distributed worker as seen by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Stable identifier.
    pub worker_id: String,
    /// Lifecycle status.
    pub status: WorkerStatus,
    /// Task ids currently assigned.
    #[serde(default)]
    pub current_tasks: Vec<String>,
    /// Last heartbeat instant.
    pub last_heartbeat: DateTime<Utc>,
    /// Maximum tasks this worker runs concurrently.
    pub max_concurrent_tasks: u32,
    /// Optional capability specialisations.
    #[serde(default)]
    pub specializations: Vec<String>,
}

impl Worker {
    /// Whether the worker missed its liveness window relative to `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > Duration::seconds(WORKER_LIVENESS_WINDOW_SECS)
    }

    /// Free capacity, saturating at zero.
    pub fn free_slots(&self) -> u32 {
        self.max_concurrent_tasks
            .saturating_sub(self.current_tasks.len() as u32)
    }
}
