//! Cirrus Storage - Object store over a redb key-value backend
//!
//! This crate provides:
//! - KVStore trait for storage abstraction
//! - redb-based implementation
//! - Key encoding and secondary indices (labels, owners)
//! - A typed object store with finalizer-aware deletion and watch events

pub mod encoding;
pub mod error;
pub mod kv;
pub mod object_store;
pub mod redb_backend;

// Re-export commonly used types
pub use encoding::{IndexKey, KeyEncoder};
pub use error::{Result, StorageError};
pub use kv::{KVStore, Keyspace, Transaction};
pub use object_store::{EventBusConfig, ListParams, ObjectStore};
pub use redb_backend::RedbBackend;
