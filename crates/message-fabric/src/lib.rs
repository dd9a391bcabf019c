//! Message Fabric
//!
//! Everything that crosses a stage boundary travels as an [`Envelope`]
//! through a named [`BoundedQueue`]. Each hand-off has its own capacity so
//! a slow consumer back-pressures only its own producer.

mod envelope;
mod queue;

pub use envelope::{Batch, Envelope, EnvelopeKind, Payload, Stage};
pub use queue::{BoundedQueue, MessageFabric, QueueStats, SendMode};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Queue names used by the gateway
pub mod names {
    pub const UDS_FRAMES: &str = "uds_frames";
    pub const OBD_FRAMES: &str = "obd_frames";
    pub const DECODED: &str = "decoded";
}

/// Fabric errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("Queue '{0}' is full")]
    QueueFull(String),

    #[error("Timed out waiting for space in queue '{0}'")]
    Timeout(String),

    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("Queue '{0}' already exists")]
    DuplicateQueue(String),

    #[error("Queue '{0}' needs a capacity of at least 1")]
    InvalidCapacity(String),

    #[error("Queue '{0}' is closed")]
    Closed(String),
}

/// Queue capacities and default deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub uds_frames: usize,
    pub obd_frames: usize,
    pub decoded: usize,
    /// Deadline for blocking enqueues
    pub enqueue_timeout_ms: u64,
    /// Consumer poll timeout
    pub dequeue_timeout_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            uds_frames: 1000,
            obd_frames: 1000,
            decoded: 500,
            enqueue_timeout_ms: 100,
            dequeue_timeout_ms: 100,
        }
    }
}

impl FabricConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    /// Create the gateway's three queues on `fabric`
    pub fn build(&self, fabric: &MessageFabric<Envelope>) -> Result<(), FabricError> {
        fabric.create_queue(names::UDS_FRAMES, self.uds_frames)?;
        fabric.create_queue(names::OBD_FRAMES, self.obd_frames)?;
        fabric.create_queue(names::DECODED, self.decoded)?;
        Ok(())
    }
}
