//! Record stores

use crate::{OfflineRecord, RecordMeta, StorageError};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Durable home of sealed records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: &OfflineRecord) -> Result<(), StorageError>;

    /// Returns false if the record does not exist
    async fn mark_transmitted(&self, sequence: u64) -> Result<bool, StorageError>;

    async fn delete(&self, sequence: u64) -> Result<(), StorageError>;

    async fn fetch(&self, sequence: u64) -> Result<Option<OfflineRecord>, StorageError>;

    /// Headers of every stored record, ordered by sequence
    async fn load_index(&self) -> Result<Vec<RecordMeta>, StorageError>;
}

/// SQLite-backed store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Database(format!("{}: {}", parent.display(), e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS offline_records (
                sequence INTEGER PRIMARY KEY,
                created_at_ms INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL,
                transmitted INTEGER NOT NULL DEFAULT 0,
                data BLOB NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_offline_pending ON offline_records (transmitted, sequence)",
        )
        .execute(&pool)
        .await?;

        info!("Opened offline store at {}", path.display());
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert(&self, record: &OfflineRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO offline_records (sequence, created_at_ms, size_bytes, transmitted, data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.sequence as i64)
        .bind(record.created_at_ms)
        .bind(record.size_bytes() as i64)
        .bind(record.transmitted)
        .bind(record.data.as_slice())
        .execute(&self.pool)
        .await?;
        debug!("Persisted record {} ({} bytes)", record.sequence, record.size_bytes());
        Ok(())
    }

    async fn mark_transmitted(&self, sequence: u64) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE offline_records SET transmitted = 1 WHERE sequence = ?")
            .bind(sequence as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, sequence: u64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM offline_records WHERE sequence = ?")
            .bind(sequence as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch(&self, sequence: u64) -> Result<Option<OfflineRecord>, StorageError> {
        let row: Option<(i64, i64, bool, Vec<u8>)> = sqlx::query_as(
            "SELECT sequence, created_at_ms, transmitted, data FROM offline_records WHERE sequence = ?",
        )
        .bind(sequence as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(sequence, created_at_ms, transmitted, data)| OfflineRecord {
            sequence: sequence as u64,
            created_at_ms,
            transmitted,
            data,
        }))
    }

    async fn load_index(&self) -> Result<Vec<RecordMeta>, StorageError> {
        let rows: Vec<(i64, i64, bool)> = sqlx::query_as(
            "SELECT sequence, size_bytes, transmitted FROM offline_records ORDER BY sequence",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(sequence, size_bytes, transmitted)| RecordMeta {
                sequence: sequence as u64,
                size_bytes: size_bytes as u64,
                transmitted,
            })
            .collect())
    }
}

/// Volatile store; also holds records while the durable store is failing
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<u64, OfflineRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.lock().contains_key(&sequence)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, OfflineRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: &OfflineRecord) -> Result<(), StorageError> {
        self.lock().insert(record.sequence, record.clone());
        Ok(())
    }

    async fn mark_transmitted(&self, sequence: u64) -> Result<bool, StorageError> {
        Ok(match self.lock().get_mut(&sequence) {
            Some(record) => {
                record.transmitted = true;
                true
            }
            None => false,
        })
    }

    async fn delete(&self, sequence: u64) -> Result<(), StorageError> {
        self.lock().remove(&sequence);
        Ok(())
    }

    async fn fetch(&self, sequence: u64) -> Result<Option<OfflineRecord>, StorageError> {
        Ok(self.lock().get(&sequence).cloned())
    }

    async fn load_index(&self) -> Result<Vec<RecordMeta>, StorageError> {
        Ok(self.lock().values().map(OfflineRecord::meta).collect())
    }
}
