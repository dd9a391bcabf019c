//! Offline Buffer Implementation

use crate::record::encode_batch;
use crate::store::{MemoryStore, RecordStore, SqliteStore};
use crate::{OfflineConfig, OfflineRecord, StorageError};
use alerting::{HealthEvent, HealthReporter};
use message_fabric::{Batch, Envelope};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct OpenBatch {
    envelopes: Vec<Envelope>,
    bytes: usize,
    opened_at: Instant,
    opened_at_ms: u64,
}

impl OpenBatch {
    fn new() -> Self {
        Self {
            envelopes: Vec::new(),
            bytes: 0,
            opened_at: Instant::now(),
            opened_at_ms: wall_clock_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    size_bytes: u64,
    transmitted: bool,
    /// Held by the in-memory fallback rather than the durable store
    volatile: bool,
}

#[derive(Debug, Default)]
struct Counters {
    envelopes: u64,
    sealed: u64,
    evicted_transmitted: u64,
    data_loss_events: u64,
    data_loss_bytes: u64,
    persist_failures: u64,
}

struct State {
    open: Option<OpenBatch>,
    next_sequence: u64,
    index: BTreeMap<u64, IndexEntry>,
    total_bytes: u64,
    degraded: bool,
    counters: Counters,
}

/// Offline buffer statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineStats {
    pub total_records: usize,
    pub pending_records: usize,
    pub transmitted_records: usize,
    pub total_bytes: u64,
    pub pending_bytes: u64,
    pub ceiling_bytes: u64,
    pub utilization: f64,
    pub open_envelopes: usize,
    pub open_bytes: usize,
    pub next_sequence: u64,
    pub envelopes_admitted: u64,
    pub batches_sealed: u64,
    pub evicted_transmitted: u64,
    pub data_loss_events: u64,
    pub data_loss_bytes: u64,
    pub persist_failures: u64,
    pub degraded: bool,
}

/// Batches envelopes and hands sealed records to the publisher.
///
/// Shared between the offline worker (admit/seal) and the publisher
/// (pending/mark_transmitted); every operation takes the internal lock.
pub struct OfflineBuffer {
    config: OfflineConfig,
    store: Box<dyn RecordStore>,
    fallback: MemoryStore,
    state: Mutex<State>,
    sealed: Notify,
    health: Option<HealthReporter>,
}

impl OfflineBuffer {
    /// Open the SQLite store named in `config`
    pub async fn open(config: OfflineConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let store = SqliteStore::open(&config.db_path).await?;
        Self::with_store(config, Box::new(store)).await
    }

    /// Build on any store, resuming its sequence numbering
    pub async fn with_store(config: OfflineConfig, store: Box<dyn RecordStore>) -> Result<Self, StorageError> {
        config.validate()?;
        let metas = store.load_index().await?;

        let mut index = BTreeMap::new();
        let mut total_bytes = 0;
        for meta in &metas {
            total_bytes += meta.size_bytes;
            index.insert(
                meta.sequence,
                IndexEntry {
                    size_bytes: meta.size_bytes,
                    transmitted: meta.transmitted,
                    volatile: false,
                },
            );
        }
        let next_sequence = index.keys().next_back().map_or(1, |last| last + 1);
        let pending = index.values().filter(|e| !e.transmitted).count();

        info!(
            "Offline buffer ready: {} records ({} pending, {} bytes), next sequence {}",
            index.len(),
            pending,
            total_bytes,
            next_sequence
        );

        Ok(Self {
            config,
            store,
            fallback: MemoryStore::new(),
            state: Mutex::new(State {
                open: None,
                next_sequence,
                index,
                total_bytes,
                degraded: false,
                counters: Counters::default(),
            }),
            sealed: Notify::new(),
            health: None,
        })
    }

    pub fn with_health(mut self, reporter: HealthReporter) -> Self {
        self.health = Some(reporter);
        self
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    fn report(&self, event: HealthEvent) {
        if let Some(health) = &self.health {
            health.report(event);
        }
    }

    /// Add an envelope to the open batch. Returns the sequence number of a
    /// batch sealed as a consequence, if any.
    pub async fn admit(&self, envelope: Envelope) -> Result<Option<u64>, StorageError> {
        let size = postcard::to_allocvec(&envelope)?.len();
        let mut state = self.state.lock().await;
        let mut sealed = None;

        let seal_first = state.open.as_ref().is_some_and(|open| {
            let expired = open.opened_at.elapsed() >= self.config.batch_window();
            let overflow = !open.envelopes.is_empty() && open.bytes + size > self.config.batch_max_bytes;
            expired || overflow
        });
        if seal_first {
            sealed = self.seal_locked(&mut state).await?;
        }

        let open = state.open.get_or_insert_with(OpenBatch::new);
        open.envelopes.push(envelope);
        open.bytes += size;
        let full = open.bytes >= self.config.batch_max_bytes;
        state.counters.envelopes += 1;

        if full {
            sealed = self.seal_locked(&mut state).await?;
        }
        Ok(sealed)
    }

    /// Seal the open batch if it has reached the age limit
    pub async fn seal_if_expired(&self) -> Result<Option<u64>, StorageError> {
        let mut state = self.state.lock().await;
        let expired = state
            .open
            .as_ref()
            .is_some_and(|open| open.opened_at.elapsed() >= self.config.batch_window());
        if !expired {
            return Ok(None);
        }
        self.seal_locked(&mut state).await
    }

    /// Seal whatever is open, regardless of size or age
    pub async fn flush(&self) -> Result<Option<u64>, StorageError> {
        let mut state = self.state.lock().await;
        self.seal_locked(&mut state).await
    }

    /// Time until the open batch expires, if one is open
    pub async fn time_to_expiry(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state
            .open
            .as_ref()
            .map(|open| self.config.batch_window().saturating_sub(open.opened_at.elapsed()))
    }

    async fn seal_locked(&self, state: &mut State) -> Result<Option<u64>, StorageError> {
        let Some(open) = state.open.take() else {
            return Ok(None);
        };
        if open.envelopes.is_empty() {
            return Ok(None);
        }

        let sequence = state.next_sequence;
        let count = open.envelopes.len();
        let bytes = open.bytes;
        let record = match seal_open(open, sequence, encode_batch) {
            Ok(record) => record,
            Err((open, e)) => {
                error!("Sealing batch {} failed, keeping it open: {}", sequence, e);
                state.open = Some(open);
                return Err(e);
            }
        };

        debug!(
            "Sealed batch {}: {} envelopes, {} bytes ({} compressed)",
            sequence,
            count,
            bytes,
            record.size_bytes()
        );

        state.next_sequence += 1;
        state.counters.sealed += 1;
        self.store_record(state, record).await;
        self.sealed.notify_one();
        Ok(Some(sequence))
    }

    async fn store_record(&self, state: &mut State, record: OfflineRecord) {
        let size = record.size_bytes();
        self.evict_for(state, size).await;

        let durable = if state.degraded {
            self.try_recover(state, &record).await
        } else {
            self.persist_with_retries(state, &record).await
        };

        if !durable {
            if let Err(e) = self.fallback.insert(&record).await {
                error!("Record {} could not be held in memory: {}", record.sequence, e);
            }
        }
        state.index.insert(
            record.sequence,
            IndexEntry {
                size_bytes: size,
                transmitted: false,
                volatile: !durable,
            },
        );
        state.total_bytes += size;
    }

    async fn persist_with_retries(&self, state: &mut State, record: &OfflineRecord) -> bool {
        let attempts = self.config.persist_retries;
        for attempt in 1..=attempts {
            match self.store.insert(record).await {
                Ok(()) => return true,
                Err(e) => {
                    state.counters.persist_failures += 1;
                    warn!(
                        "Persisting record {} failed (attempt {}/{}): {}",
                        record.sequence, attempt, attempts, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.persist_retry_ms)).await;
                    } else {
                        error!("Offline store unavailable, holding records in memory: {}", e);
                        state.degraded = true;
                        self.report(HealthEvent::PersistenceDegraded { reason: e.to_string() });
                    }
                }
            }
        }
        false
    }

    /// One attempt per sealed batch while degraded
    async fn try_recover(&self, state: &mut State, record: &OfflineRecord) -> bool {
        match self.store.insert(record).await {
            Ok(()) => {
                info!("Offline store writable again");
                state.degraded = false;
                self.report(HealthEvent::PersistenceRecovered);
                self.migrate_volatile(state).await;
                true
            }
            Err(e) => {
                state.counters.persist_failures += 1;
                debug!("Offline store still failing: {}", e);
                false
            }
        }
    }

    /// Move records held in memory during an outage into the durable store.
    /// Stops at the first failed write; the rest stay volatile.
    async fn migrate_volatile(&self, state: &mut State) {
        let volatile: Vec<u64> = state
            .index
            .iter()
            .filter(|(_, e)| e.volatile)
            .map(|(sequence, _)| *sequence)
            .collect();
        let mut moved = 0;

        for sequence in volatile {
            let record = match self.fallback.fetch(sequence).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!("Record {} missing from memory", sequence);
                    continue;
                }
                Err(e) => {
                    warn!("Reading record {} from memory failed: {}", sequence, e);
                    continue;
                }
            };
            if let Err(e) = self.store.insert(&record).await {
                state.counters.persist_failures += 1;
                warn!("Moving record {} to the offline store failed: {}", sequence, e);
                break;
            }
            if let Some(entry) = state.index.get_mut(&sequence) {
                entry.volatile = false;
            }
            if let Err(e) = self.fallback.delete(sequence).await {
                warn!("Failed to release in-memory record {}: {}", sequence, e);
            }
            moved += 1;
        }

        if moved > 0 {
            info!("Moved {} in-memory records to the offline store", moved);
        }
    }

    /// Make room for `incoming` bytes: transmitted records go first, oldest
    /// first; only when none remain is untransmitted data given up.
    async fn evict_for(&self, state: &mut State, incoming: u64) {
        while state.total_bytes + incoming > self.config.storage_ceiling_bytes {
            let victim = state
                .index
                .iter()
                .find(|(_, e)| e.transmitted)
                .or_else(|| state.index.iter().next())
                .map(|(seq, e)| (*seq, *e));
            let Some((sequence, entry)) = victim else {
                break;
            };

            state.index.remove(&sequence);
            state.total_bytes -= entry.size_bytes;
            self.delete_record(sequence, entry).await;

            if entry.transmitted {
                state.counters.evicted_transmitted += 1;
                debug!("Evicted transmitted record {} ({} bytes)", sequence, entry.size_bytes);
            } else {
                state.counters.data_loss_events += 1;
                state.counters.data_loss_bytes += entry.size_bytes;
                warn!(
                    "Data loss: evicted untransmitted record {} ({} bytes) at storage ceiling",
                    sequence, entry.size_bytes
                );
                self.report(HealthEvent::DataLoss {
                    sequence,
                    bytes: entry.size_bytes,
                });
            }
        }
    }

    async fn delete_record(&self, sequence: u64, entry: IndexEntry) {
        let result = if entry.volatile {
            self.fallback.delete(sequence).await
        } else {
            self.store.delete(sequence).await
        };
        if let Err(e) = result {
            warn!("Failed to delete record {}: {}", sequence, e);
        }
    }

    /// Up to `limit` untransmitted records, strictly ascending by sequence
    pub async fn pending(&self, limit: usize) -> Result<Vec<OfflineRecord>, StorageError> {
        let state = self.state.lock().await;
        let mut records = Vec::new();

        for (sequence, entry) in state.index.iter().filter(|(_, e)| !e.transmitted) {
            if records.len() >= limit {
                break;
            }
            let found = if entry.volatile {
                self.fallback.fetch(*sequence).await?
            } else {
                self.store.fetch(*sequence).await?
            };
            match found {
                Some(record) => records.push(record),
                None => warn!("Record {} missing from store", sequence),
            }
        }
        Ok(records)
    }

    /// Number of untransmitted records
    pub async fn pending_count(&self) -> usize {
        let state = self.state.lock().await;
        state.index.values().filter(|e| !e.transmitted).count()
    }

    /// Record an acknowledged publish. Unknown or already-marked sequences
    /// are a no-op.
    pub async fn mark_transmitted(&self, sequence: u64) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.index.get_mut(&sequence) else {
            debug!("mark_transmitted: record {} no longer held", sequence);
            return Ok(());
        };
        if entry.transmitted {
            return Ok(());
        }
        entry.transmitted = true;

        if entry.volatile {
            // Nothing durable to keep for retention
            let size = entry.size_bytes;
            state.index.remove(&sequence);
            state.total_bytes -= size;
            self.fallback.delete(sequence).await?;
            return Ok(());
        }

        if let Err(e) = self.store.mark_transmitted(sequence).await {
            // The record will be sent again after a restart
            warn!("Failed to persist transmitted flag for record {}: {}", sequence, e);
        }
        Ok(())
    }

    /// Resolves after the next batch is sealed (or immediately if one was
    /// sealed since the last wait)
    pub async fn wait_sealed(&self) {
        self.sealed.notified().await;
    }

    pub async fn stats(&self) -> OfflineStats {
        let state = self.state.lock().await;
        let (pending_records, pending_bytes) = state
            .index
            .values()
            .filter(|e| !e.transmitted)
            .fold((0, 0), |(n, b), e| (n + 1, b + e.size_bytes));
        let ceiling = self.config.storage_ceiling_bytes;

        OfflineStats {
            total_records: state.index.len(),
            pending_records,
            transmitted_records: state.index.len() - pending_records,
            total_bytes: state.total_bytes,
            pending_bytes,
            ceiling_bytes: ceiling,
            utilization: state.total_bytes as f64 / ceiling as f64,
            open_envelopes: state.open.as_ref().map_or(0, |o| o.envelopes.len()),
            open_bytes: state.open.as_ref().map_or(0, |o| o.bytes),
            next_sequence: state.next_sequence,
            envelopes_admitted: state.counters.envelopes,
            batches_sealed: state.counters.sealed,
            evicted_transmitted: state.counters.evicted_transmitted,
            data_loss_events: state.counters.data_loss_events,
            data_loss_bytes: state.counters.data_loss_bytes,
            persist_failures: state.counters.persist_failures,
            degraded: state.degraded,
        }
    }
}

/// Turn an open batch into a record. On failure the batch is handed back
/// intact so its envelopes can be sealed later.
fn seal_open<F>(open: OpenBatch, sequence: u64, encode: F) -> Result<OfflineRecord, (OpenBatch, StorageError)>
where
    F: FnOnce(&Batch) -> Result<Vec<u8>, StorageError>,
{
    let batch = Batch {
        sequence,
        opened_at_ms: open.opened_at_ms,
        sealed_at_ms: wall_clock_ms(),
        envelopes: open.envelopes,
    };
    match encode(&batch) {
        Ok(data) => Ok(OfflineRecord {
            sequence,
            created_at_ms: batch.sealed_at_ms as i64,
            transmitted: false,
            data,
        }),
        Err(e) => Err((
            OpenBatch {
                envelopes: batch.envelopes,
                bytes: open.bytes,
                opened_at: open.opened_at,
                opened_at_ms: open.opened_at_ms,
            },
            e,
        )),
    }
}

fn wall_clock_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
