#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **operon-store-memory** – In-memory capability drivers for the Operon
//! engine.
//!
//! This crate provides fast, non-persistent implementations of every
//! capability trait in `operon-store-core`: a document store with
//! field-level updates and atomic increments, a brute-force cosine vector
//! index, a delayed dispatcher with cancellable handles, and an object
//! store returning stable URLs. All data lives in process memory and is
//! lost on termination, which makes these drivers ideal for tests,
//! development, and single-node deployments.

pub mod dispatch;
pub mod document;
pub mod object;
pub mod vector;

pub use dispatch::MemoryDispatcher;
pub use document::MemoryDocumentStore;
pub use object::MemoryObjectStore;
pub use vector::MemoryVectorIndex;
