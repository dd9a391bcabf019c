//! Named bounded queues

use crate::FabricError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// How `enqueue` behaves when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Wait for space up to the deadline, then fail with `Timeout`
    Blocking(Duration),
    /// Fail immediately with `QueueFull`
    NonBlocking,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub capacity: usize,
    pub depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    /// Items rejected on a full queue, including blocking timeouts
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded FIFO over a tokio mpsc channel.
///
/// Any number of producers may enqueue; the receiver sits behind an async
/// mutex so consumers can share a handle, though each gateway queue has
/// exactly one.
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    counters: Counters,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self, FabricError> {
        let name = name.into();
        if capacity == 0 {
            return Err(FabricError::InvalidCapacity(name));
        }
        let (tx, rx) = mpsc::channel(capacity);
        info!("Created queue '{}' with capacity {}", name, capacity);
        Ok(Self {
            name,
            capacity,
            tx,
            rx: Mutex::new(rx),
            counters: Counters::default(),
        })
    }

    pub async fn enqueue(&self, item: T, mode: SendMode) -> Result<(), FabricError> {
        let result = match mode {
            SendMode::NonBlocking => self.tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => FabricError::QueueFull(self.name.clone()),
                TrySendError::Closed(_) => FabricError::Closed(self.name.clone()),
            }),
            SendMode::Blocking(deadline) => {
                self.tx.send_timeout(item, deadline).await.map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => FabricError::Timeout(self.name.clone()),
                    SendTimeoutError::Closed(_) => FabricError::Closed(self.name.clone()),
                })
            }
        };

        match &result {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(FabricError::QueueFull(_)) | Err(FabricError::Timeout(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!("Queue '{}' full, {} items dropped so far", self.name, dropped);
                }
            }
            Err(_) => {}
        }
        result
    }

    /// Wait up to `timeout` for the next item
    pub async fn dequeue(&self, timeout: Duration) -> Option<T> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => {
                self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Ok(None) | Err(_) => None,
        }
    }

    /// Take the next item if one is ready and no other consumer is waiting
    pub fn try_dequeue(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        match rx.try_recv() {
            Ok(item) => {
                self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Refuse further enqueues; items already queued can still be dequeued
    pub async fn close(&self) {
        self.rx.lock().await.close();
        debug!("Queue '{}' closed", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently waiting
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            capacity: self.capacity,
            depth: self.depth(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            dropped: self.dropped_count(),
        }
    }
}

/// Registry of named queues
pub struct MessageFabric<T> {
    queues: RwLock<HashMap<String, Arc<BoundedQueue<T>>>>,
}

impl<T> MessageFabric<T> {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_queue(&self, name: &str, capacity: usize) -> Result<Arc<BoundedQueue<T>>, FabricError> {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues.contains_key(name) {
            return Err(FabricError::DuplicateQueue(name.to_string()));
        }
        let queue = Arc::new(BoundedQueue::new(name, capacity)?);
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Handle to a named queue, for workers that use it in a loop
    pub fn queue(&self, name: &str) -> Result<Arc<BoundedQueue<T>>, FabricError> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| FabricError::UnknownQueue(name.to_string()))
    }

    pub async fn enqueue(&self, name: &str, item: T, mode: SendMode) -> Result<(), FabricError> {
        self.queue(name)?.enqueue(item, mode).await
    }

    /// `Ok(None)` when nothing arrived within `timeout`
    pub async fn dequeue(&self, name: &str, timeout: Duration) -> Result<Option<T>, FabricError> {
        Ok(self.queue(name)?.dequeue(timeout).await)
    }

    /// Snapshot of every queue, sorted by name
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<QueueStats> = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|q| q.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// All queue handles, sorted by name
    pub fn queues(&self) -> Vec<Arc<BoundedQueue<T>>> {
        let mut queues: Vec<_> = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        queues
    }
}

impl<T> Default for MessageFabric<T> {
    fn default() -> Self {
        Self::new()
    }
}
