//! In-process deferred dispatcher.
//!
//! Payloads enqueue against a named target and are delivered to the handler
//! registered for that target after the requested delay. Handles stay
//! cancellable until the moment of delivery; delivery and cancellation race
//! on a single pending-map removal, so exactly one of them wins.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use operon_store_core::{DeferredDispatch, DispatchHandle};

/// Handler invoked with each delivered payload.
pub type DispatchTargetFn =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone)]
struct Pending {
    target: String,
    payload: Value,
}

/// An in-memory deferred-dispatch transport.
///
/// Delivery is at-least-once from the consumer's perspective (the engine
/// deduplicates by task id); within one process it is in fact exactly-once.
#[derive(Clone, Default)]
pub struct MemoryDispatcher {
    targets: Arc<DashMap<String, DispatchTargetFn>>,
    pending: Arc<DashMap<String, Pending>>,
}

impl MemoryDispatcher {
    /// Creates a dispatcher with no targets registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler payloads for `target` are delivered to.
    pub fn register_target<F, Fut>(&self, target: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: DispatchTargetFn = Arc::new(move |payload| Box::pin(handler(payload)));
        self.targets.insert(target.to_string(), wrapped);
    }

    /// Number of dispatches that are enqueued but not yet delivered.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl DeferredDispatch for MemoryDispatcher {
    async fn enqueue(
        &self,
        target: &str,
        payload: Value,
        delay: Option<Duration>,
        _priority: Option<u8>,
    ) -> Result<DispatchHandle> {
        let handle = format!("dispatch_{}", Uuid::new_v4());
        self.pending.insert(
            handle.clone(),
            Pending { target: target.to_string(), payload },
        );

        let pending = Arc::clone(&self.pending);
        let targets = Arc::clone(&self.targets);
        let task_handle = handle.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            } else {
                // Let the caller finish persisting before the callback lands.
                tokio::task::yield_now().await;
            }
            // Whoever removes the entry owns it; a concurrent cancel wins here.
            let Some((_, entry)) = pending.remove(&task_handle) else {
                return;
            };
            match targets.get(&entry.target) {
                Some(handler) => {
                    debug!(target = %entry.target, handle = %task_handle, "delivering dispatch");
                    handler(entry.payload).await;
                }
                None => {
                    warn!(target = %entry.target, "dispatch target has no registered handler");
                }
            }
        });

        Ok(DispatchHandle(handle))
    }

    async fn cancel(&self, handle: &DispatchHandle) -> Result<bool> {
        Ok(self.pending.remove(&handle.0).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn payloads_are_delivered_to_registered_targets() {
        let dispatcher = MemoryDispatcher::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        dispatcher.register_target("execute", move |payload| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(payload["task_id"], "t1");
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        dispatcher
            .enqueue("execute", json!({"task_id": "t1"}), None, Some(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_before_delivery_wins() {
        let dispatcher = MemoryDispatcher::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        dispatcher.register_target("execute", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let handle = dispatcher
            .enqueue("execute", json!({"task_id": "t1"}), Some(Duration::from_secs(60)), None)
            .await
            .unwrap();

        assert!(dispatcher.cancel(&handle).await.unwrap());
        // Second cancel reports the handle as gone.
        assert!(!dispatcher.cancel(&handle).await.unwrap());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_after_delivery_reports_false() {
        let dispatcher = MemoryDispatcher::new();
        dispatcher.register_target("execute", |_| async {});
        let handle = dispatcher.enqueue("execute", json!({}), None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dispatcher.cancel(&handle).await.unwrap());
    }
}
