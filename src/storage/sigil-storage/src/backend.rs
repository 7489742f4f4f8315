//! Storage backend trait definition.

use async_trait::async_trait;

use crate::error::StorageError;

/// Storage backend trait for implementing different storage engines.
///
/// Keys are `/`-separated paths. Revocations and CRLs are never deleted:
/// they form an audit trail.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get a value by key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Put a value with a key, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Insert a value only if the key is absent.
    ///
    /// Must be atomic: of two concurrent inserts for the same key exactly one
    /// succeeds and the other fails with [`StorageError::AlreadyExists`].
    async fn insert(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a value by key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List keys with a prefix, in ascending order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
