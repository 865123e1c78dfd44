//! Leaky-bucket rate gate in front of the primary data source.
//!
//! Two layers: a short-horizon bucket smoothing calls to 2/s, and a coarse
//! 10 000-requests-per-10-minutes window. When the upstream returns its own
//! throttling signal the gate enters a cool-down during which calls are
//! refused as quota failures.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use tracing::warn;

use operon_types::{EngineError, EngineResult};

/// Steady-state requests per second to the data source.
pub const BUCKET_RATE_PER_SEC: u32 = 2;

/// Coarse window cap.
pub const WINDOW_MAX_REQUESTS: u64 = 10_000;

/// Coarse window length.
pub const WINDOW_LENGTH: Duration = Duration::from_secs(600);

/// Cool-down applied when the upstream signals throttling.
pub const COOLDOWN: Duration = Duration::from_secs(30);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug)]
struct WindowState {
    window_started: Instant,
    window_count: u64,
    cooldown_until: Option<Instant>,
}

/// Leaky-bucket gate with a coarse request window and upstream cool-down.
pub struct RateGate {
    bucket: DirectLimiter,
    state: Mutex<WindowState>,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGate {
    /// Gate with the contract defaults (2/s, 10 000 per 10 minutes).
    pub fn new() -> Self {
        let per_sec = NonZeroU32::new(BUCKET_RATE_PER_SEC).expect("non-zero rate");
        Self {
            bucket: RateLimiter::direct(Quota::per_second(per_sec)),
            state: Mutex::new(WindowState {
                window_started: Instant::now(),
                window_count: 0,
                cooldown_until: None,
            }),
        }
    }

    /// Acquire a slot, waiting for the bucket when necessary.
    ///
    /// Fails fast with a quota error while cooling down or once the coarse
    /// window is exhausted.
    pub async fn acquire(&self) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            let now = Instant::now();

            if let Some(until) = state.cooldown_until {
                if now < until {
                    return Err(EngineError::UpstreamQuota {
                        message: "data source is cooling down after upstream throttling".to_string(),
                    });
                }
                state.cooldown_until = None;
            }

            if now.duration_since(state.window_started) > WINDOW_LENGTH {
                state.window_started = now;
                state.window_count = 0;
            }
            if state.window_count >= WINDOW_MAX_REQUESTS {
                return Err(EngineError::UpstreamQuota {
                    message: format!(
                        "data source window exhausted ({WINDOW_MAX_REQUESTS} requests / {}s)",
                        WINDOW_LENGTH.as_secs()
                    ),
                });
            }
            state.window_count += 1;
        }

        self.bucket.until_ready().await;
        Ok(())
    }

    /// Record that the upstream returned its own throttling signal.
    pub fn note_upstream_throttle(&self) {
        warn!("upstream throttling signal observed, entering cool-down");
        self.state.lock().cooldown_until = Some(Instant::now() + COOLDOWN);
    }

    /// Whether the gate is currently cooling down.
    pub fn is_cooling_down(&self) -> bool {
        self.state
            .lock()
            .cooldown_until
            .is_some_and(|until| Instant::now() < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_in_steady_state() {
        let gate = RateGate::new();
        gate.acquire().await.unwrap();
        assert!(!gate.is_cooling_down());
    }

    #[tokio::test]
    async fn cooldown_refuses_as_quota() {
        let gate = RateGate::new();
        gate.note_upstream_throttle();
        assert!(gate.is_cooling_down());
        let err = gate.acquire().await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamQuota { .. }));
    }
}
