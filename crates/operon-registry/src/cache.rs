//! Advisory in-process template cache.
//!
//! Purely an optimisation: the store stays authoritative, and the
//! orchestrator invalidates entries before a retry executes so repaired
//! scripts are always picked up (TTL expiry alone would not be enough).

use std::time::{Duration, Instant};

use dashmap::DashMap;

use operon_types::Template;

/// Default cache TTL.
pub const TEMPLATE_CACHE_TTL: Duration = Duration::from_secs(300);

/// TTL cache keyed by template id.
pub struct TemplateCache {
    entries: DashMap<String, (Instant, Template)>,
    ttl: Duration,
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new(TEMPLATE_CACHE_TTL)
    }
}

impl TemplateCache {
    /// Cache with a custom TTL.
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    /// Fresh entry for `id`, if any.
    pub fn get(&self, id: &str) -> Option<Template> {
        let entry = self.entries.get(id)?;
        let (stored_at, template) = entry.value();
        if stored_at.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(id);
            return None;
        }
        Some(template.clone())
    }

    /// Insert or refresh an entry.
    pub fn insert(&self, template: Template) {
        self.entries
            .insert(template.template_id.clone(), (Instant::now(), template));
    }

    /// Drop one entry. Required before a retry-task executes.
    pub fn invalidate(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Live entry count (expired entries may still be counted).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_types::ParameterSchema;

    fn template(id: &str) -> Template {
        Template::new(
            id.to_string(),
            format!("{id}_name"),
            "desc".to_string(),
            ParameterSchema::empty(),
            r#"{"steps":[{"op":"checkpoint"}]}"#.to_string(),
        )
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = TemplateCache::new(Duration::from_millis(0));
        cache.insert(template("t1"));
        // Zero TTL: immediately stale.
        assert!(cache.get("t1").is_none());
    }

    #[test]
    fn invalidation_is_immediate() {
        let cache = TemplateCache::default();
        cache.insert(template("t1"));
        assert!(cache.get("t1").is_some());
        cache.invalidate("t1");
        assert!(cache.get("t1").is_none());
    }
}
