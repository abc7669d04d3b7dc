use crate::Result;
use bytes::Bytes;

/// Separate key ranges of the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyspace {
    /// Serialized objects keyed by storage key
    Objects,
    /// Secondary indices and bookkeeping (revision counter)
    Indices,
}

/// Key-value store trait
pub trait KVStore: Send + Sync {
    /// Get a value by key
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Bytes>>;

    /// Put a key-value pair
    fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key
    fn delete(&self, space: Keyspace, key: &[u8]) -> Result<()>;

    /// Scan keys with a given prefix
    fn scan(&self, space: Keyspace, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Check if a key exists
    fn exists(&self, space: Keyspace, key: &[u8]) -> Result<bool>;

    /// Begin a write transaction
    fn transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// Transaction trait for atomic operations
pub trait Transaction: Send {
    /// Get a value by key
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Bytes>>;

    /// Put a key-value pair
    fn put(&mut self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key
    fn delete(&mut self, space: Keyspace, key: &[u8]) -> Result<()>;

    /// Commit the transaction
    fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    fn rollback(self: Box<Self>) -> Result<()>;
}
