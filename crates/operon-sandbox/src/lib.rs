#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-sandbox** – Isolated script execution for the Operon engine.
//!
//! Template scripts are declarative step programs, not arbitrary code. The
//! sandbox interprets them under a strict capability envelope:
//!
//! - **Static refusals**: before anything runs, the raw source is scanned
//!   against a banned-pattern set (process globals, dynamic evaluation,
//!   module loading, store admin handles, credential identifiers,
//!   prompt-injection sentinels), every referenced data-source method is
//!   checked against the safe/dangerous partition, and list/batch/payload
//!   caps are enforced.
//! - **Bounded resources**: per-task and per-call wall-clock deadlines, a
//!   declared memory tier, and a leaky-bucket rate gate in front of the
//!   primary data source.
//! - **Narrow capabilities**: scripts see exactly four injected functions -
//!   the guarded data source, bounded LLM generation, a structured logger,
//!   and a progress sink. Nothing else exists inside the sandbox.
//! - **Cooperative cancellation**: a checkpoint between steps consults the
//!   task document and raises a typed `Cancelled` error when the
//!   orchestrator has flagged the task.
//!
//! One execution walks the state machine
//! `loaded → validated → running → {completed | failed | timed_out | cancelled}`;
//! the only terminal transitions are out of `running`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod capability;
pub mod executor;
pub mod limits;
pub mod policy;
pub mod rategate;
pub mod script;

pub use capability::{CapabilityEnvelope, DataSourceProvider, GuardedDataSource, TaskStateMirror};
pub use executor::{ExecutionOutcome, ExecutionReport, SandboxExecutor};
pub use limits::{ResourceMeter, SandboxLimits};
pub use policy::{MethodClass, ScriptPolicy};
pub use rategate::RateGate;
pub use script::{ScriptProgram, ScriptStep};

/// Default per-task wall-clock budget.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(12 * 60);

/// Default per-capability-call wall-clock budget.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(12 * 60);

/// Hard cap on rows a single list-style call may request.
pub const MAX_LIST_ROWS: u64 = 500;

/// Hard cap on sub-commands in one batched call.
pub const MAX_BATCH_COMMANDS: usize = 50;

/// Hard cap on a single call's parameter payload, in bytes.
pub const MAX_PARAM_PAYLOAD_BYTES: usize = 100 * 1024;

/// State of one sandboxed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Script source loaded, not yet validated.
    Loaded,
    /// Static validation passed.
    Validated,
    /// Steps are executing.
    Running,
    /// All steps completed.
    Completed,
    /// A step failed.
    Failed,
    /// The task or a call exceeded its wall-clock budget.
    TimedOut,
    /// The cooperative checkpoint observed a cancellation flag.
    Cancelled,
}

impl ExecutionState {
    /// Whether this state ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled)
    }
}
