#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-store-core** – Capability abstractions for the Operon engine.
//!
//! This crate defines the contracts the engine depends on without providing
//! concrete implementations: a document store with field-level updates and
//! atomic increments, a cosine-distance vector index with pre-filters, a
//! deferred-dispatch transport, and an object store for script artefacts.
//!
//! Drivers (in-memory, cloud-backed, etc.) implement these traits in
//! separate crates that depend on this core abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub mod artefact;

//─────────────────────────────
//  Field-level update operations
//─────────────────────────────

/// Key of the marker object a server-timestamp sentinel serialises to.
///
/// The sentinel is legal for scalar fields only; stores must reject it
/// inside array items (see [`StoreError::SentinelInArray`]).
pub const SERVER_TIMESTAMP_KEY: &str = "__server_timestamp__";

/// Build the server-timestamp sentinel value.
pub fn server_timestamp() -> Value {
    serde_json::json!({ SERVER_TIMESTAMP_KEY: true })
}

/// Whether `value` is (or contains at its top level) the sentinel marker.
pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.contains_key(SERVER_TIMESTAMP_KEY))
}

/// A single field-level mutation applied by [`DocumentStore::update`].
///
/// Field paths are dot-separated (`"progress.percentage"`). Updates touch
/// only the named fields, so concurrent writers of sibling fields never
/// clobber each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldOp {
    /// Replace the field with a value. A [`server_timestamp`] sentinel is
    /// resolved to the store's clock at apply time.
    Set(Value),
    /// Atomically add to a numeric field, creating it at the delta if absent.
    Increment(i64),
    /// Append values absent from an array field (set semantics).
    ArrayUnion(Vec<Value>),
    /// Remove matching values from an array field.
    ArrayRemove(Vec<Value>),
    /// Delete the field.
    Delete,
}

//─────────────────────────────
//  Queries
//─────────────────────────────

/// Comparison operator for document queries and vector pre-filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Array field contains the value.
    Contains,
}

/// A single field predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Dot-separated field path.
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Comparison operand.
    pub value: Value,
}

impl Filter {
    /// Shorthand for an equality predicate.
    pub fn eq(field: &str, value: Value) -> Self {
        Self { field: field.to_string(), op: FilterOp::Eq, value }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A filtered, ordered, limited document query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    /// Conjunctive predicates.
    pub filters: Vec<Filter>,
    /// Sort keys applied in order.
    pub order_by: Vec<(String, SortDirection)>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
}

impl Query {
    /// Empty query matching everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Builder-style filter.
    pub fn filter(mut self, field: &str, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter { field: field.to_string(), op, value });
        self
    }

    /// Builder-style sort key.
    pub fn order(mut self, field: &str, direction: SortDirection) -> Self {
        self.order_by.push((field.to_string(), direction));
        self
    }

    /// Builder-style row cap.
    pub fn take(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

//─────────────────────────────
//  Document store
//─────────────────────────────

/// Abstraction over a document-collection store with field-level updates.
///
/// Documents are JSON objects addressed by `(collection, id)`. Writes and
/// reads are strongly consistent within a document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create or fully replace a document.
    async fn put(&self, collection: &str, id: &str, doc: Value) -> anyhow::Result<()>;

    /// Fetch a document. Returns `None` when absent.
    async fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Value>>;

    /// Apply field-level mutations to an existing document.
    ///
    /// Fails with [`StoreError::NotFound`] when the document is absent and
    /// [`StoreError::SentinelInArray`] when an array operation carries a
    /// server-timestamp sentinel inside an item.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        ops: Vec<(String, FieldOp)>,
    ) -> anyhow::Result<()>;

    /// Apply `ops` only if `guard_field` currently equals `expected`.
    ///
    /// Returns whether the mutation was applied. This is the document-level
    /// compare-and-set used for template version bumps.
    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        guard_field: &str,
        expected: Value,
        ops: Vec<(String, FieldOp)>,
    ) -> anyhow::Result<bool>;

    /// Delete a document. Deleting an absent document is a no-op.
    async fn delete(&self, collection: &str, id: &str) -> anyhow::Result<()>;

    /// Run a filtered, ordered query. Returns `(id, document)` pairs.
    async fn query(&self, collection: &str, query: Query) -> anyhow::Result<Vec<(String, Value)>>;
}

//─────────────────────────────
//  Vector index
//─────────────────────────────

/// One k-nearest hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestHit {
    /// Document id the vector belongs to.
    pub doc_id: String,
    /// Cosine similarity in `[-1, 1]`; higher is closer.
    pub similarity: f32,
}

/// A k-nearest query against one vector field of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestQuery {
    /// Vector field to search (`name_embedding`, `embedding`, ...).
    pub vector_field: String,
    /// Query vector; must match the index dimensionality.
    pub query: Vec<f32>,
    /// Number of neighbours to return.
    pub k: usize,
    /// Metadata pre-filters applied before ranking.
    pub filters: Vec<Filter>,
}

/// Abstraction over a dense-vector index with cosine distance.
///
/// Each `(collection, doc_id, field)` triple holds one vector plus a
/// metadata object the pre-filters evaluate against. An empty index returns
/// an empty hit list, never an error.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace a vector and its filter metadata.
    async fn upsert(
        &self,
        collection: &str,
        doc_id: &str,
        field: &str,
        vector: Vec<f32>,
        metadata: Value,
    ) -> anyhow::Result<()>;

    /// Drop all vectors for a document.
    async fn remove(&self, collection: &str, doc_id: &str) -> anyhow::Result<()>;

    /// k-nearest neighbours by cosine similarity, best first.
    async fn find_nearest(
        &self,
        collection: &str,
        query: NearestQuery,
    ) -> anyhow::Result<Vec<NearestHit>>;
}

//─────────────────────────────
//  Deferred dispatch
//─────────────────────────────

/// Opaque handle to a pending dispatch, usable for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchHandle(pub String);

/// Abstraction over the transport that delivers scheduled task callbacks to
/// the execute entry point.
///
/// Delivery is at-least-once; the orchestrator deduplicates re-deliveries by
/// task id. Retries and backoff are the transport's responsibility.
#[async_trait]
pub trait DeferredDispatch: Send + Sync {
    /// Schedule `payload` for delivery to `target` after an optional delay.
    async fn enqueue(
        &self,
        target: &str,
        payload: Value,
        delay: Option<Duration>,
        priority: Option<u8>,
    ) -> anyhow::Result<DispatchHandle>;

    /// Cancel a pending dispatch. Returns `false` when the handle is unknown
    /// or the payload was already delivered.
    async fn cancel(&self, handle: &DispatchHandle) -> anyhow::Result<bool>;
}

//─────────────────────────────
//  Object store
//─────────────────────────────

/// Metadata attached to every stored artefact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// User or system identity that produced the artefact.
    pub uploaded_by: String,
    /// Upload instant.
    pub upload_time: DateTime<Utc>,
    /// Artefact file type tag (`html`, `drawio`, `png`, ...).
    pub file_type: String,
    /// Original filename before path prefixing.
    pub original_filename: String,
    /// Task that produced the artefact, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Template the task instantiated, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

/// Abstraction over a bucket of stable, publicly addressable objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `path` and return a stable public URL.
    ///
    /// Objects carry `content_disposition: attachment; filename=<name>` so
    /// browsers download rather than render them.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        content_disposition: &str,
        metadata: ObjectMetadata,
    ) -> anyhow::Result<String>;
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors raised by capability drivers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Document or handle does not exist.
    #[error("not found: {collection}/{id}")]
    NotFound {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },
    /// A server-timestamp sentinel appeared inside an array item, which the
    /// durable store forbids.
    #[error("server-timestamp sentinel inside array item at {field}")]
    SentinelInArray {
        /// Field path the offending operation targeted.
        field: String,
    },
    /// A field operation did not match the stored field's type.
    #[error("type mismatch at {field}: {reason}")]
    TypeMismatch {
        /// Field path.
        field: String,
        /// What went wrong.
        reason: String,
    },
    /// Query vector dimensionality differs from the indexed vectors.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Indexed dimensionality.
        expected: usize,
        /// Query dimensionality.
        actual: usize,
    },
    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        artefact::ArtefactKind, server_timestamp, DeferredDispatch, DispatchHandle, DocumentStore,
        FieldOp, Filter, FilterOp, NearestHit, NearestQuery, ObjectMetadata, ObjectStore, Query,
        SortDirection, StoreError, VectorIndex,
    };
}
