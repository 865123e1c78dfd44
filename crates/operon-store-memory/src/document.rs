//! In-memory document store with field-level updates.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use operon_store_core::{
    is_server_timestamp, DocumentStore, FieldOp, Filter, FilterOp, Query, SortDirection,
    StoreError,
};

/// An in-memory, non-persistent document store.
///
/// Collections are `HashMap<id, Value>` behind a single `RwLock`. Field
/// updates mutate only the addressed paths, mirroring the field-level
/// semantics durable stores provide, so concurrent writers of sibling
/// fields compose correctly.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryDocumentStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `collection`.
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let mut guard = self.collections.write().await;
        guard
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn update(&self, collection: &str, id: &str, ops: Vec<(String, FieldOp)>) -> Result<()> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        for (path, op) in ops {
            apply_op(doc, &path, op)?;
        }
        Ok(())
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        guard_field: &str,
        expected: Value,
        ops: Vec<(String, FieldOp)>,
    ) -> Result<bool> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        if lookup(doc, guard_field) != Some(&expected) {
            return Ok(false);
        }
        for (path, op) in ops {
            apply_op(doc, &path, op)?;
        }
        Ok(true)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        if let Some(c) = self.collections.write().await.get_mut(collection) {
            c.remove(id);
        }
        Ok(())
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<(String, Value)>> {
        let guard = self.collections.read().await;
        let Some(coll) = guard.get(collection) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<(String, Value)> = coll
            .iter()
            .filter(|(_, doc)| query.filters.iter().all(|f| matches_filter(doc, f)))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect();

        rows.sort_by(|(_, a), (_, b)| {
            for (field, direction) in &query.order_by {
                let ord = compare_values(lookup(a, field), lookup(b, field));
                let ord = match direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

//─────────────────────────────
//  Field-op application
//─────────────────────────────

fn apply_op(doc: &mut Value, path: &str, op: FieldOp) -> Result<()> {
    match op {
        FieldOp::Set(value) => {
            let resolved = if is_server_timestamp(&value) {
                Value::String(Utc::now().to_rfc3339())
            } else {
                value
            };
            *slot(doc, path)? = resolved;
        }
        FieldOp::Increment(delta) => {
            let slot = slot(doc, path)?;
            let current = match slot {
                Value::Null => 0,
                Value::Number(n) => n.as_i64().ok_or_else(|| StoreError::TypeMismatch {
                    field: path.to_string(),
                    reason: "increment target is not an integer".to_string(),
                })?,
                _ => {
                    return Err(StoreError::TypeMismatch {
                        field: path.to_string(),
                        reason: "increment target is not numeric".to_string(),
                    }
                    .into())
                }
            };
            *slot = Value::from(current + delta);
        }
        FieldOp::ArrayUnion(items) => {
            reject_sentinels(path, &items)?;
            let slot = slot(doc, path)?;
            if slot.is_null() {
                *slot = Value::Array(Vec::new());
            }
            let arr = slot.as_array_mut().ok_or_else(|| StoreError::TypeMismatch {
                field: path.to_string(),
                reason: "array-union target is not an array".to_string(),
            })?;
            for item in items {
                if !arr.contains(&item) {
                    arr.push(item);
                }
            }
        }
        FieldOp::ArrayRemove(items) => {
            reject_sentinels(path, &items)?;
            let slot = slot(doc, path)?;
            if let Some(arr) = slot.as_array_mut() {
                arr.retain(|v| !items.contains(v));
            }
        }
        FieldOp::Delete => {
            remove(doc, path);
        }
    }
    Ok(())
}

fn reject_sentinels(path: &str, items: &[Value]) -> Result<()> {
    if items.iter().any(is_server_timestamp) {
        return Err(StoreError::SentinelInArray { field: path.to_string() }.into());
    }
    Ok(())
}

/// Navigate to the slot addressed by a dotted path, creating intermediate
/// objects on the way.
fn slot<'a>(doc: &'a mut Value, path: &str) -> Result<&'a mut Value> {
    let mut current = doc;
    for segment in path.split('.') {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let obj = current.as_object_mut().ok_or_else(|| StoreError::TypeMismatch {
            field: path.to_string(),
            reason: format!("segment '{segment}' is not an object"),
        })?;
        current = obj.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(current)
}

fn remove(doc: &mut Value, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else { return };
    let mut current = doc;
    for segment in segments {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(obj) = current.as_object_mut() {
        obj.remove(last);
    }
}

//─────────────────────────────
//  Query evaluation
//─────────────────────────────

/// Resolve a dotted path against a document.
pub(crate) fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

pub(crate) fn matches_filter(doc: &Value, filter: &Filter) -> bool {
    let field = lookup(doc, &filter.field);
    match filter.op {
        FilterOp::Eq => field == Some(&filter.value),
        FilterOp::Ne => field != Some(&filter.value),
        FilterOp::Contains => field
            .and_then(Value::as_array)
            .is_some_and(|arr| arr.contains(&filter.value)),
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            let ord = compare_values(field, Some(&filter.value));
            match filter.op {
                FilterOp::Gt => ord == Ordering::Greater,
                FilterOp::Gte => ord != Ordering::Less,
                FilterOp::Lt => ord == Ordering::Less,
                FilterOp::Lte => ord != Ordering::Greater,
                _ => unreachable!(),
            }
        }
    }
}

/// Total order over the JSON values the engine stores: null < numbers <
/// strings < bools. RFC 3339 timestamps order correctly as strings.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

fn rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_store_core::server_timestamp;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = MemoryDocumentStore::new();
        store.put("tasks", "t1", json!({"status": "pending"})).await.unwrap();
        assert_eq!(
            store.get("tasks", "t1").await.unwrap(),
            Some(json!({"status": "pending"}))
        );
        store.delete("tasks", "t1").await.unwrap();
        assert_eq!(store.get("tasks", "t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn field_updates_touch_only_their_paths() {
        let store = MemoryDocumentStore::new();
        store
            .put("tasks", "t1", json!({"status": "pending", "progress": {"percentage": 0}}))
            .await
            .unwrap();

        store
            .update(
                "tasks",
                "t1",
                vec![
                    ("status".into(), FieldOp::Set(json!("running"))),
                    ("progress.percentage".into(), FieldOp::Set(json!(40))),
                    ("execution.started_at".into(), FieldOp::Set(server_timestamp())),
                ],
            )
            .await
            .unwrap();

        let doc = store.get("tasks", "t1").await.unwrap().unwrap();
        assert_eq!(doc["status"], "running");
        assert_eq!(doc["progress"]["percentage"], 40);
        // Sentinel resolved to a concrete timestamp string.
        assert!(doc["execution"]["started_at"].is_string());
    }

    #[tokio::test]
    async fn increments_are_atomic_per_document() {
        let store = MemoryDocumentStore::new();
        store.put("memories", "m1", json!({"times_retrieved": 2})).await.unwrap();
        store
            .update("memories", "m1", vec![("times_retrieved".into(), FieldOp::Increment(3))])
            .await
            .unwrap();
        let doc = store.get("memories", "m1").await.unwrap().unwrap();
        assert_eq!(doc["times_retrieved"], 5);
    }

    #[tokio::test]
    async fn array_union_rejects_sentinels() {
        let store = MemoryDocumentStore::new();
        store.put("tasks", "t1", json!({"errors": []})).await.unwrap();

        let err = store
            .update(
                "tasks",
                "t1",
                vec![("errors".into(), FieldOp::ArrayUnion(vec![json!({"at": server_timestamp()})]))],
            )
            .await;
        // Sentinel nested one level down is fine to union...
        assert!(err.is_ok());

        let err = store
            .update("tasks", "t1", vec![("errors".into(), FieldOp::ArrayUnion(vec![server_timestamp()]))])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sentinel"));
    }

    #[tokio::test]
    async fn update_missing_document_fails() {
        let store = MemoryDocumentStore::new();
        let err = store
            .update("tasks", "nope", vec![("status".into(), FieldOp::Set(json!("running")))])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn compare_and_set_guards_on_field() {
        let store = MemoryDocumentStore::new();
        store.put("templates", "tp1", json!({"version": 3, "script": "a"})).await.unwrap();

        let applied = store
            .update_if(
                "templates",
                "tp1",
                "version",
                json!(3),
                vec![
                    ("version".into(), FieldOp::Set(json!(4))),
                    ("script".into(), FieldOp::Set(json!("b"))),
                ],
            )
            .await
            .unwrap();
        assert!(applied);

        let stale = store
            .update_if(
                "templates",
                "tp1",
                "version",
                json!(3),
                vec![("script".into(), FieldOp::Set(json!("c")))],
            )
            .await
            .unwrap();
        assert!(!stale);
        let doc = store.get("templates", "tp1").await.unwrap().unwrap();
        assert_eq!(doc["script"], "b");
    }

    #[tokio::test]
    async fn queries_filter_order_and_limit() {
        let store = MemoryDocumentStore::new();
        for (id, priority, created) in [
            ("a", 50, "2026-01-01T00:00:00Z"),
            ("b", 80, "2026-01-02T00:00:00Z"),
            ("c", 80, "2026-01-01T00:00:00Z"),
            ("d", 10, "2026-01-03T00:00:00Z"),
        ] {
            store
                .put(
                    "tasks",
                    id,
                    json!({"status": "pending", "priority": priority, "created_at": created}),
                )
                .await
                .unwrap();
        }
        store.put("tasks", "e", json!({"status": "running", "priority": 99})).await.unwrap();

        let rows = store
            .query(
                "tasks",
                Query::all()
                    .filter("status", FilterOp::Eq, json!("pending"))
                    .order("priority", SortDirection::Desc)
                    .order("created_at", SortDirection::Asc)
                    .take(3),
            )
            .await
            .unwrap();

        let ids: Vec<&str> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn empty_collection_queries_are_empty_not_errors() {
        let store = MemoryDocumentStore::new();
        let rows = store.query("void", Query::all()).await.unwrap();
        assert!(rows.is_empty());
    }
}
