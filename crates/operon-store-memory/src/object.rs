//! In-memory object store returning stable URLs.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use operon_store_core::{ObjectMetadata, ObjectStore};

/// Base URL stored objects are addressed under.
const BASE_URL: &str = "https://objects.invalid/operon";

/// One stored object, retained for test inspection.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// Content type.
    pub content_type: String,
    /// Content disposition header value.
    pub content_disposition: String,
    /// Attached metadata.
    pub metadata: ObjectMetadata,
}

/// An in-memory, non-persistent object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored object by its bucket path.
    pub async fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.read().await.get(path).cloned()
    }

    /// Number of stored objects.
    pub async fn count(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        content_disposition: &str,
        metadata: ObjectMetadata,
    ) -> Result<String> {
        self.objects.write().await.insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                content_disposition: content_disposition.to_string(),
                metadata,
            },
        );
        Ok(format!("{BASE_URL}/{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn stored_objects_get_stable_urls() {
        let store = MemoryObjectStore::new();
        let url = store
            .put(
                "reports/2026-03-01T00-00-00Z_revenue.html",
                b"<html></html>".to_vec(),
                "text/html",
                "attachment; filename=revenue.html",
                ObjectMetadata {
                    uploaded_by: "system".into(),
                    upload_time: Utc::now(),
                    file_type: "html".into(),
                    original_filename: "revenue.html".into(),
                    task_id: Some("task_1_report".into()),
                    template_id: None,
                },
            )
            .await
            .unwrap();

        assert!(url.ends_with("reports/2026-03-01T00-00-00Z_revenue.html"));
        let stored = store.get("reports/2026-03-01T00-00-00Z_revenue.html").await.unwrap();
        assert_eq!(stored.content_type, "text/html");
        assert_eq!(stored.metadata.task_id.as_deref(), Some("task_1_report"));
        assert_eq!(store.count().await, 1);
    }
}
