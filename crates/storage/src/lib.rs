//! Storage Layer
//!
//! Offline buffer between the decoders and the publisher. Decoded envelopes
//! are grouped into batches, sealed batches are encoded with postcard,
//! gzip-compressed and persisted to SQLite with a monotonically increasing
//! sequence number, then replayed in order until acknowledged.

mod buffer;
mod record;
mod store;

pub use buffer::{OfflineBuffer, OfflineStats};
pub use record::{decode_record, encode_batch, OfflineRecord, RecordMeta};
pub use store::{MemoryStore, RecordStore, SqliteStore};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Record {0} not found")]
    NotFound(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<postcard::Error> for StorageError {
    fn from(e: postcard::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Offline buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// SQLite database file
    pub db_path: String,
    /// Seal the open batch once its serialized size reaches this (256 KB)
    pub batch_max_bytes: usize,
    /// Seal the open batch once it is this old (5 s)
    pub batch_window_ms: u64,
    /// Ceiling on persisted compressed bytes (1 GiB)
    pub storage_ceiling_bytes: u64,
    /// Write attempts before switching to in-memory degraded mode
    pub persist_retries: u32,
    /// Pause between write attempts
    pub persist_retry_ms: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/telemetry_buffer.db".to_string(),
            batch_max_bytes: 256 * 1024,
            batch_window_ms: 5000,
            storage_ceiling_bytes: 1024 * 1024 * 1024,
            persist_retries: 3,
            persist_retry_ms: 50,
        }
    }
}

impl OfflineConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.batch_max_bytes == 0 {
            return Err(StorageError::InvalidConfig("batch_max_bytes must be positive".into()));
        }
        if self.batch_window_ms == 0 {
            return Err(StorageError::InvalidConfig("batch_window_ms must be positive".into()));
        }
        if self.storage_ceiling_bytes < self.batch_max_bytes as u64 {
            return Err(StorageError::InvalidConfig(format!(
                "storage ceiling {} is smaller than one batch ({})",
                self.storage_ceiling_bytes, self.batch_max_bytes
            )));
        }
        if self.persist_retries == 0 {
            return Err(StorageError::InvalidConfig("persist_retries must be at least 1".into()));
        }
        Ok(())
    }
}
