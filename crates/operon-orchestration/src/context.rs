//! Conversation-context cache.
//!
//! Bounded at 500 entries with a 15-minute TTL. Eviction is LRU with
//! activity scoring: recently active conversations beat idle ones, and
//! entries younger than five minutes are protected unless the cache is
//! over capacity with nothing else to evict.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

/// Maximum cached conversations.
pub const CONTEXT_CACHE_CAP: usize = 500;

/// Entry TTL.
pub const CONTEXT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Age below which entries are protected from eviction.
pub const PROTECTED_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    created: Instant,
    last_activity: Instant,
    activity: u32,
}

/// Bounded conversation-context cache with activity-aware eviction.
#[derive(Default)]
pub struct ContextCache {
    entries: DashMap<String, Entry>,
}

impl ContextCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry and record the activity.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entry = self.entries.get_mut(key)?;
        if entry.created.elapsed() >= CONTEXT_CACHE_TTL {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        entry.last_activity = Instant::now();
        entry.activity += 1;
        Some(entry.value.clone())
    }

    /// Insert or refresh a conversation context.
    pub fn insert(&self, key: &str, value: Value) {
        if !self.entries.contains_key(key) && self.entries.len() >= CONTEXT_CACHE_CAP {
            self.evict_one();
        }
        let now = Instant::now();
        self.entries
            .entry(key.to_string())
            .and_modify(|e| {
                e.value = value.clone();
                e.last_activity = now;
                e.activity += 1;
            })
            .or_insert(Entry { value, created: now, last_activity: now, activity: 1 });
    }

    /// Entry count, including not-yet-collected expired entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict the least valuable entry: the stalest by last activity among
    /// entries past the protected age, or the globally stalest when
    /// everything is young and the cache is still over cap.
    fn evict_one(&self) {
        // Stalest last-activity = largest elapsed.
        let victim = self
            .entries
            .iter()
            .filter(|e| e.created.elapsed() >= PROTECTED_AGE)
            .max_by_key(|e| e.last_activity.elapsed())
            .map(|e| e.key().clone())
            .or_else(|| {
                self.entries
                    .iter()
                    .max_by_key(|e| e.last_activity.elapsed())
                    .map(|e| e.key().clone())
            });
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_records_activity() {
        let cache = ContextCache::new();
        cache.insert("conv-1", json!({"topic": "invoices"}));
        assert_eq!(cache.get("conv-1"), Some(json!({"topic": "invoices"})));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn over_cap_insertion_evicts() {
        let cache = ContextCache::new();
        for i in 0..CONTEXT_CACHE_CAP {
            cache.insert(&format!("conv-{i}"), json!(i));
        }
        assert_eq!(cache.len(), CONTEXT_CACHE_CAP);
        cache.insert("conv-new", json!("fresh"));
        assert_eq!(cache.len(), CONTEXT_CACHE_CAP);
        assert!(cache.get("conv-new").is_some());
    }

    #[test]
    fn recent_activity_beats_idleness() {
        let cache = ContextCache::new();
        for i in 0..CONTEXT_CACHE_CAP {
            cache.insert(&format!("conv-{i}"), json!(i));
        }
        // Touch one entry so it is the most recently active.
        cache.get("conv-0");
        cache.insert("conv-new", json!("fresh"));
        // The touched entry survives the eviction.
        assert!(cache.get("conv-0").is_some());
    }
}
