//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A create-only insert hit an existing key.
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// The backend could not be opened or reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// A read or write against the backend failed.
    #[error("query failed: {0}")]
    Query(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Caller supplied an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
