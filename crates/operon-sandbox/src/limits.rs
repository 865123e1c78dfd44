//! Resource limits and usage metering for sandboxed execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use operon_types::{EngineError, EngineResult, ResourceUsage, DEFAULT_MEMORY_TIER_MB};

use crate::{DEFAULT_CALL_TIMEOUT, DEFAULT_TASK_TIMEOUT};

/// Limits one execution runs under.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Per-task wall-clock budget.
    pub task_timeout: Duration,
    /// Per-capability-call wall-clock budget.
    pub call_timeout: Duration,
    /// Memory tier granted to the task, in megabytes.
    pub memory_tier_mb: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            task_timeout: DEFAULT_TASK_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            memory_tier_mb: DEFAULT_MEMORY_TIER_MB,
        }
    }
}

impl SandboxLimits {
    /// Limits for a template's declared memory tier.
    pub fn for_memory_tier(memory_tier_mb: u64) -> Self {
        Self { memory_tier_mb, ..Self::default() }
    }
}

/// Tracks the resources one execution has consumed.
///
/// Memory accounting is an estimate: every bound step result charges its
/// serialized size. That is deliberately conservative; the sandbox has no
/// true allocator hooks and the tier exists to stop runaway result sets.
#[derive(Debug, Default)]
pub struct ResourceMeter {
    memory_bytes: AtomicU64,
    llm_tokens: AtomicU64,
    data_source_calls: AtomicU64,
}

impl ResourceMeter {
    /// Fresh meter with zero usage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `bytes` against the memory tier, failing when the tier is
    /// exhausted.
    pub fn charge_memory(&self, bytes: u64, limits: &SandboxLimits) -> EngineResult<()> {
        let total = self.memory_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let limit = limits.memory_tier_mb * 1024 * 1024;
        if total > limit {
            return Err(EngineError::ResourceExceeded {
                resource: "memory".to_string(),
                current: format!("{}B", total),
                limit: format!("{}MB", limits.memory_tier_mb),
            });
        }
        Ok(())
    }

    /// Record tokens consumed by an in-script generation.
    pub fn record_llm_tokens(&self, tokens: u64) {
        self.llm_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Record one data-source call.
    pub fn record_data_source_call(&self) {
        self.data_source_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the usage counters.
    pub fn snapshot(&self) -> ResourceUsage {
        ResourceUsage {
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            llm_tokens: self.llm_tokens.load(Ordering::Relaxed),
            data_source_calls: self.data_source_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_tier_is_enforced() {
        let limits = SandboxLimits::for_memory_tier(1); // 1 MB
        let meter = ResourceMeter::new();
        assert!(meter.charge_memory(512 * 1024, &limits).is_ok());
        let err = meter.charge_memory(600 * 1024, &limits).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExceeded { .. }));
    }

    #[test]
    fn snapshots_reflect_counters() {
        let meter = ResourceMeter::new();
        meter.record_llm_tokens(120);
        meter.record_data_source_call();
        meter.record_data_source_call();
        let usage = meter.snapshot();
        assert_eq!(usage.llm_tokens, 120);
        assert_eq!(usage.data_source_calls, 2);
    }

    #[test]
    fn default_limits_match_contract() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.task_timeout, Duration::from_secs(720));
        assert_eq!(limits.memory_tier_mb, 512);
    }
}
