//! # Sigil Storage - SQLite Backend
//!
//! SQLite implementation of the storage backend. Each CA store lives in its
//! own database file; every write is appended to a history table together
//! with the acting identity.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use sigil_storage::{StorageBackend, StorageError};

/// SQLite storage backend.
///
/// The database lives at `{base_path}/{name}.db`.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    actor: Option<String>,
    db_path: PathBuf,
}

impl SqliteBackend {
    /// Opens or creates a SQLite database.
    ///
    /// # Arguments
    ///
    /// * `base_path` - Directory where databases are stored
    /// * `name` - Database name (must match `[a-z0-9_-]+`)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The name is invalid
    /// - The directory cannot be created
    /// - The database connection fails
    pub async fn open(base_path: impl AsRef<Path>, name: &str) -> Result<Self, StorageError> {
        Self::validate_name(name)?;

        let base = base_path.as_ref();
        tokio::fs::create_dir_all(base)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to create directory: {e}")))?;

        let db_path = base.join(format!("{name}.db"));
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        debug!(name = %name, path = %db_path.display(), "Opening SQLite database");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let backend = Self {
            pool,
            actor: None,
            db_path,
        };

        backend.migrate().await?;

        info!(name = %name, "SQLite backend ready");

        Ok(backend)
    }

    /// Sets the actor recorded in the write history.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Only allows: lowercase letters, digits, underscore, hyphen.
    fn validate_name(name: &str) -> Result<(), StorageError> {
        if name.is_empty() {
            return Err(StorageError::InvalidInput("name cannot be empty".into()));
        }

        if name.len() > 64 {
            return Err(StorageError::InvalidInput("name too long".into()));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

        if !valid {
            return Err(StorageError::InvalidInput(
                "name must match [a-z0-9_-]+".into(),
            ));
        }

        Ok(())
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        debug!("Running database migrations");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                version    INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS kv_history (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                key        TEXT NOT NULL,
                version    INTEGER NOT NULL,
                operation  TEXT NOT NULL,
                actor      TEXT,
                timestamp  INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_history_key ON kv_history (key)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Connection(format!("migration failed: {e}")))?;
        }

        debug!("Migrations complete");

        Ok(())
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }

    async fn record_history(
        &self,
        key: &str,
        version: i64,
        operation: &str,
        now: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_history (key, version, operation, actor, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(version)
        .bind(operation)
        .bind(self.actor.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let now = Self::now();

        let (version,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO kv_store (key, value, version, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = kv_store.version + 1,
                updated_at = excluded.updated_at
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        let operation = if version == 1 { "create" } else { "update" };
        self.record_history(key, version, operation, now).await
    }

    async fn insert(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let now = Self::now();

        let result = sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, version, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }

        self.record_history(key, 1, "create", now).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let now = Self::now();

        let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let Some((version,)) = current else {
            return Ok(());
        };

        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        self.record_history(key, version + 1, "delete", now).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteBackend) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path(), "sigil").await.unwrap();
        (tmp, backend)
    }

    #[tokio::test]
    async fn test_open_creates_db() {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path(), "my-ca").await.unwrap();

        assert!(backend.path().exists(), "database file should be created");
        assert_eq!(backend.path(), tmp.path().join("my-ca.db"));
    }

    #[tokio::test]
    async fn test_name_validation() {
        let tmp = TempDir::new().unwrap();

        for name in ["", "Sigil", "my db", "a/b", "../escape", "x.db"] {
            let result = SqliteBackend::open(tmp.path(), name).await;
            assert!(
                matches!(result, Err(StorageError::InvalidInput(_))),
                "should reject name: {name}"
            );
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_tmp, backend) = setup().await;

        assert!(backend.get("ca/root").await.unwrap().is_none());

        backend.put("ca/root", b"v1").await.unwrap();
        backend.put("ca/root", b"v2").await.unwrap();

        assert_eq!(backend.get("ca/root").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_insert_rejects_existing_key() {
        let (_tmp, backend) = setup().await;

        backend.insert("serial/7f01", b"ca-1").await.unwrap();
        let result = backend.insert("serial/7f01", b"ca-2").await;

        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
        assert_eq!(
            backend.get("serial/7f01").await.unwrap(),
            Some(b"ca-1".to_vec())
        );
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        let (_tmp, backend) = setup().await;

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.insert("serial/contended", &[i]).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_list_prefix_is_literal() {
        let (_tmp, backend) = setup().await;

        backend.put("cert/ca_1/02", b"1").await.unwrap();
        backend.put("cert/ca_1/01", b"2").await.unwrap();
        backend.put("cert/caX1/01", b"3").await.unwrap();

        let keys = backend.list("cert/ca_1/").await.unwrap();
        assert_eq!(keys, vec!["cert/ca_1/01", "cert/ca_1/02"]);
    }

    #[tokio::test]
    async fn test_history_records_actor_and_versions() {
        let (_tmp, backend) = setup().await;
        let backend = backend.with_actor("user:operator");

        backend.put("ca/root", b"v1").await.unwrap();
        backend.put("ca/root", b"v2").await.unwrap();

        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT operation, version, actor FROM kv_history WHERE key = ? ORDER BY id",
        )
        .bind("ca/root")
        .fetch_all(&backend.pool)
        .await
        .unwrap();

        assert_eq!(
            rows,
            vec![
                ("create".to_string(), 1, "user:operator".to_string()),
                ("update".to_string(), 2, "user:operator".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_records_history() {
        let (_tmp, backend) = setup().await;

        backend.put("ca/issuing", b"v1").await.unwrap();
        backend.delete("ca/issuing").await.unwrap();
        backend.delete("ca/issuing").await.unwrap();

        assert!(backend.get("ca/issuing").await.unwrap().is_none());
        backend.insert("ca/issuing", b"v2").await.unwrap();

        let ops: Vec<(String, i64)> = sqlx::query_as(
            "SELECT operation, version FROM kv_history WHERE key = ? ORDER BY id",
        )
        .bind("ca/issuing")
        .fetch_all(&backend.pool)
        .await
        .unwrap();
        assert_eq!(
            ops,
            vec![
                ("create".to_string(), 1),
                ("delete".to_string(), 2),
                ("create".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_binary_data() {
        let (_tmp, backend) = setup().await;

        let binary_data: Vec<u8> = (0..=255).collect();
        backend.put("crl/root/0001", &binary_data).await.unwrap();

        let result = backend.get("crl/root/0001").await.unwrap();
        assert_eq!(result, Some(binary_data));
    }
}
