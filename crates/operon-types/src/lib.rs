#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-types** – Shared primitive data structures for the Operon engine.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the persisted entities (tasks, templates, reasoning memories,
//! workers), the task-id grammar, the parameter-schema subset, and the typed
//! error taxonomy that flows through the whole engine. It intentionally makes
//! no assumptions about I/O, providers, or storage.

pub mod error;
pub mod memory;
pub mod schema;
pub mod task;
pub mod task_id;
pub mod template;
pub mod trajectory;
pub mod worker;

pub use error::{EngineError, EngineResult};
pub use memory::{
    MemoryCategory, MemorySource, MemoryStats, ReasoningMemory, UserIntent,
    MEMORY_CONTENT_MAX, MEMORY_DESCRIPTION_MAX, MEMORY_TITLE_MAX, PER_TEMPLATE_MEMORY_QUOTA,
};
pub use schema::{ParameterSchema, PropertySchema, SchemaType};
pub use task::{
    ArtefactRef, AutoRepairInfo, ExecutionInfo, ResourceUsage, Task, TaskErrorEntry, TaskEstimate,
    TaskProgress, TaskResultData, TaskStatus, DEFAULT_TASK_PRIORITY, DEFAULT_TASK_TTL_DAYS,
};
pub use template::{Template, DEFAULT_MEMORY_TIER_MB};
pub use trajectory::{StepOutcome, Trajectory, TrajectoryOutcome, TrajectoryStep};
pub use worker::{Worker, WorkerStatus, DEFAULT_MAX_CONCURRENT_TASKS, WORKER_LIVENESS_WINDOW_SECS};

//─────────────────────────────
//  Engine-wide constants
//─────────────────────────────

/// Dimensionality every dense embedding in the engine must have.
///
/// The embedding provider is contracted to produce vectors of exactly this
/// length; the gateway validates it and the vector index assumes it.
pub const EMBEDDING_DIM: usize = 768;

/// Dense embedding vector as produced by the embedding provider.
pub type Embedding = Vec<f32>;
