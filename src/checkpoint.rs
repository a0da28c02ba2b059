//! Persisted consumer positions.
//!
//! A checkpoint records, per `(category, group)`, the highest global
//! position a consumer has fully handled. Stores are plain upserts; never
//! moving a checkpoint backwards is the consumer's responsibility (see
//! [`CategorySource`](crate::CategorySource)).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::StoreError;

/// Storage for consumer checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The stored position for `(category, group)`, if any.
    async fn read(&self, category: &str, group: &str) -> Result<Option<i64>, StoreError>;

    /// Store `position` for `(category, group)`, replacing any previous value.
    async fn write(&self, category: &str, group: &str, position: i64) -> Result<(), StoreError>;
}

/// Checkpoints held in memory. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    positions: Mutex<HashMap<(String, String), i64>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn read(&self, category: &str, group: &str) -> Result<Option<i64>, StoreError> {
        let positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(positions
            .get(&(category.to_owned(), group.to_owned()))
            .copied())
    }

    async fn write(&self, category: &str, group: &str, position: i64) -> Result<(), StoreError> {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        positions.insert((category.to_owned(), group.to_owned()), position);
        Ok(())
    }
}

/// On-disk form of a file checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileCheckpoint {
    category: String,
    group: String,
    position: i64,
}

/// Checkpoints stored as one JSON file per `(category, group)`.
///
/// Files live at `{dir}/{category}/{group}.json` with unsafe characters in
/// either part percent-escaped. Writes go to a temporary file that is then
/// renamed over the target, so a crash never leaves a torn checkpoint. A
/// file that cannot be parsed is reported and treated as absent.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Store checkpoints under `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, category: &str, group: &str) -> PathBuf {
        self.dir
            .join(escape(category))
            .join(format!("{}.json", escape(group)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read(&self, category: &str, group: &str) -> Result<Option<i64>, StoreError> {
        Ok(load_checkpoint(&self.path(category, group))?.map(|c| c.position))
    }

    async fn write(&self, category: &str, group: &str, position: i64) -> Result<(), StoreError> {
        let checkpoint = FileCheckpoint {
            category: category.to_owned(),
            group: group.to_owned(),
            position,
        };
        save_checkpoint(&self.path(category, group), &checkpoint)?;
        Ok(())
    }
}

/// Percent-escape everything but ASCII alphanumerics, `-` and `_`.
fn escape(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for byte in part.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "%{byte:02X}");
        }
    }
    escaped
}

/// Save a checkpoint atomically, creating parent directories.
fn save_checkpoint(path: &Path, checkpoint: &FileCheckpoint) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(checkpoint).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a checkpoint. Missing and corrupt files both yield `Ok(None)`.
fn load_checkpoint(path: &Path) -> io::Result<Option<FileCheckpoint>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt checkpoint, starting from the beginning"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Checkpoints in a PostgreSQL table, typically the MessageDB database.
///
/// Call [`ensure_table`](PgCheckpointStore::ensure_table) once before use.
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Store checkpoints through `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `eventfold_checkpoints` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the statement fails.
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS eventfold_checkpoints (
                category       TEXT        NOT NULL,
                consumer_group TEXT        NOT NULL,
                position       BIGINT      NOT NULL,
                updated_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (category, consumer_group)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn read(&self, category: &str, group: &str) -> Result<Option<i64>, StoreError> {
        let position = sqlx::query_scalar::<_, i64>(
            "SELECT position FROM eventfold_checkpoints
             WHERE category = $1 AND consumer_group = $2",
        )
        .bind(category)
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;
        Ok(position)
    }

    async fn write(&self, category: &str, group: &str, position: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO eventfold_checkpoints (category, consumer_group, position)
             VALUES ($1, $2, $3)
             ON CONFLICT (category, consumer_group)
             DO UPDATE SET position = EXCLUDED.position,
                           updated_at = now()",
        )
        .bind(category)
        .bind(group)
        .bind(position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrips_and_upserts() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.read("Invoice", "emailer").await.unwrap(), None);

        store.write("Invoice", "emailer", 10).await.unwrap();
        store.write("Invoice", "emailer", 12).await.unwrap();
        store.write("Invoice", "other", 3).await.unwrap();

        assert_eq!(store.read("Invoice", "emailer").await.unwrap(), Some(12));
        assert_eq!(store.read("Invoice", "other").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn file_store_roundtrips() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path());
        store.write("Invoice", "emailer", 99).await.unwrap();

        let reopened = FileCheckpointStore::new(dir.path());
        assert_eq!(reopened.read("Invoice", "emailer").await.unwrap(), Some(99));
        assert!(!dir.path().join("Invoice").join("emailer.json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_missing_is_none() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path().join("nested"));
        assert_eq!(store.read("Invoice", "emailer").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_corrupt_is_none() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path());
        let path = store.path("Invoice", "emailer");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not valid json!!!").unwrap();

        assert_eq!(store.read("Invoice", "emailer").await.unwrap(), None);

        store.write("Invoice", "emailer", 5).await.unwrap();
        assert_eq!(store.read("Invoice", "emailer").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn consumer_group_keys_get_distinct_files() {
        let dir = tempfile::tempdir().expect("failed to create tmpdir");
        let store = FileCheckpointStore::new(dir.path());
        store.write("Invoice", "emailer:0/2", 4).await.unwrap();
        store.write("Invoice", "emailer:1/2", 7).await.unwrap();
        store.write("Invoice", "emailer_0_2", 1).await.unwrap();

        assert_eq!(store.read("Invoice", "emailer:0/2").await.unwrap(), Some(4));
        assert_eq!(store.read("Invoice", "emailer:1/2").await.unwrap(), Some(7));
        assert_eq!(store.read("Invoice", "emailer_0_2").await.unwrap(), Some(1));
    }

    #[test]
    fn escape_keeps_safe_characters() {
        assert_eq!(escape("emailer-v2_a"), "emailer-v2_a");
        assert_eq!(escape(".."), "%2E%2E");
        assert_eq!(escape("g:1/3"), "g%3A1%2F3");
    }
}
