// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by the redb key-value backend
#[derive(Error, Debug, Diagnostic)]
pub enum StorageError {
    /// The database file could not be opened or created
    #[error("Failed to open object database at {path}: {source}")]
    #[diagnostic(
        code(cirrus_storage::open),
        help("Check that the data directory exists, is writable and is not held by another cirrus process")
    )]
    Open {
        path: String,
        #[source]
        source: redb::DatabaseError,
    },

    /// A keyspace table could not be read or written
    #[error("Keyspace '{table}' failed: {message}")]
    #[diagnostic(
        code(cirrus_storage::keyspace),
        help("The database file may be corrupted; restore it or re-apply the objects")
    )]
    Keyspace {
        table: &'static str,
        message: String,
    },

    /// Beginning or committing a write transaction failed
    #[error("Transaction failed: {message}")]
    #[diagnostic(
        code(cirrus_storage::transaction),
        help("The write was not applied; the reconcile will retry it")
    )]
    Transaction { message: String },

    /// The transaction handle was used after commit or rollback
    #[error("Transaction already committed or rolled back")]
    #[diagnostic(code(cirrus_storage::transaction_closed))]
    TransactionClosed,
}

impl From<StorageError> for cirrus_core::CirrusError {
    fn from(err: StorageError) -> Self {
        cirrus_core::CirrusError::storage_error(err.to_string(), Some(Box::new(err)))
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn open(path: impl Into<String>, source: redb::DatabaseError) -> Self {
        Self::Open {
            path: path.into(),
            source,
        }
    }

    pub fn keyspace(table: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Keyspace {
            table,
            message: err.to_string(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::transaction(format!("begin: {}", err))
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::transaction(format!("commit: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_error_names_table() {
        let err = StorageError::keyspace("indices", "page checksum mismatch");
        assert_eq!(
            err.to_string(),
            "Keyspace 'indices' failed: page checksum mismatch"
        );
    }

    #[test]
    fn test_converts_into_cirrus_error() {
        let err: cirrus_core::CirrusError = StorageError::TransactionClosed.into();
        assert!(err.to_string().contains("already committed"));
    }
}
