//! CAN Capture Library
//!
//! Bus-facing edge of the gateway:
//! - `FrameSource`/`FrameSink` traits over whatever adapter is fitted
//! - A simulated bus that answers OBD-II and UDS requests
//! - The capture thread feeding the ingestion buffer
//! - ISO-TP reassembly and per-frame protocol routing

pub mod isotp;
pub mod route;
pub mod simulated;
mod worker;

pub use isotp::{IsoTpError, IsoTpMessage, Reassembler};
pub use route::{FrameRouter, Route};
pub use simulated::{SimulatedBus, SimulatedBusConfig};
pub use worker::{CaptureHandle, CaptureWorker, LinkState};

use ring_buffer::Frame;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Adapter-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Adapter disconnected: {0}")]
    Disconnected(String),

    #[error("CAN bus off")]
    BusOff,

    #[error("Adapter read timeout")]
    Timeout,

    #[error("Transmit failed: {0}")]
    Transmit(String),

    #[error("Invalid frame from adapter: {0}")]
    InvalidFrame(String),
}

/// Anything that yields captured frames.
///
/// `read_frame` must not block: `Ok(None)` means nothing is waiting and the
/// caller decides how long to idle.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Anything that can put a request frame on the bus
pub trait FrameSink {
    fn transmit(&mut self, id: u32, payload: &[u8]) -> Result<(), CaptureError>;
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Channel tag stamped on captured frames
    pub channel: u8,
    /// Use the built-in simulated bus instead of a hardware adapter
    pub simulated: bool,
    /// Sleep when the adapter has nothing to read
    pub idle_ms: u64,
    /// Sleep after an adapter error before polling again
    pub error_backoff_ms: u64,
    /// Answer ECU first frames with an ISO-TP flow control frame
    pub send_flow_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            simulated: true,
            idle_ms: 10,
            error_backoff_ms: 100,
            send_flow_control: true,
        }
    }
}
