//! Ingestion Ring Buffer
//!
//! Fixed-capacity frame store that decouples bus arrival rate from decoder
//! throughput. A full buffer rejects new frames instead of overwriting unseen
//! ones, and counts every rejection.

mod buffer;

pub use buffer::{BufferFull, RingBuffer, RingBufferConfig, DEFAULT_CAPACITY};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest identifier representable in an 11-bit (standard) CAN frame
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Largest identifier representable in a 29-bit (extended) CAN frame
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Classic CAN payload limit
pub const MAX_PAYLOAD: usize = 8;

/// Reasons a frame cannot be constructed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("identifier {id:#X} out of range (extended: {extended})")]
    IdOutOfRange { id: u32, extended: bool },

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte frame limit")]
    PayloadTooLong(usize),
}

/// One raw frame captured from the diagnostic bus.
///
/// Frames are only created through [`Frame::new`], which validates the
/// identifier width and payload length, so a frame is never partially
/// populated. Fields are private; a captured frame is never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; MAX_PAYLOAD],
    /// Monotonic receipt time in microseconds since capture start
    timestamp_us: u64,
    /// Source channel tag (bus index on multi-channel adapters)
    channel: u8,
}

impl Frame {
    /// Build a validated frame
    pub fn new(
        id: u32,
        extended: bool,
        payload: &[u8],
        timestamp_us: u64,
        channel: u8,
    ) -> Result<Self, FrameError> {
        let max_id = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if id > max_id {
            return Err(FrameError::IdOutOfRange { id, extended });
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }

        let mut data = [0u8; MAX_PAYLOAD];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            id,
            extended,
            len: payload.len() as u8,
            data,
            timestamp_us,
            channel,
        })
    }

    /// Build a standard (11-bit) frame on channel 0
    pub fn standard(id: u32, payload: &[u8], timestamp_us: u64) -> Result<Self, FrameError> {
        Self::new(id, false, payload, timestamp_us, 0)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Payload bytes actually carried by the frame
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Same frame tagged with the capturing channel
    pub fn on_channel(self, channel: u8) -> Self {
        Self { channel, ..self }
    }
}
