//! ISO-TP (ISO 15765-2) Segmentation and Reassembly
//!
//! Diagnostic messages longer than seven bytes (VIN reads, DTC lists) span
//! a first frame followed by consecutive frames. Reassembly is tracked per
//! bus identifier so interleaved responses from several ECUs don't mix.

use ring_buffer::Frame;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Largest message a classic (12-bit length) first frame can announce
pub const MAX_MESSAGE_LEN: usize = 4095;

/// N_Cr: maximum gap between consecutive frames
pub const DEFAULT_TIMEOUT_US: u64 = 1_000_000;

const PADDING: u8 = 0x55;

/// Protocol control information type (high nibble of byte 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciType {
    Single,
    First,
    Consecutive,
    FlowControl,
}

impl PciType {
    pub fn of(payload: &[u8]) -> Option<Self> {
        match payload.first()? >> 4 {
            0x0 => Some(PciType::Single),
            0x1 => Some(PciType::First),
            0x2 => Some(PciType::Consecutive),
            0x3 => Some(PciType::FlowControl),
            _ => None,
        }
    }
}

/// Transport-layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    #[error("Invalid PCI byte {0:02X}")]
    InvalidPci(u8),

    #[error("Invalid length {length} in {kind:?} frame")]
    InvalidLength { kind: PciType, length: usize },

    #[error("Consecutive frame from {address:03X} without a first frame")]
    UnexpectedConsecutive { address: u32 },

    #[error("Sequence mismatch from {address:03X}: expected {expected}, got {actual}")]
    SequenceMismatch { address: u32, expected: u8, actual: u8 },

    #[error("Reassembly from {address:03X} timed out")]
    Timeout { address: u32 },

    #[error("Message of {0} bytes cannot be segmented")]
    Unsegmentable(usize),
}

/// A complete transport-layer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoTpMessage {
    pub address: u32,
    pub data: Vec<u8>,
    /// Receipt time of the final frame
    pub timestamp_us: u64,
}

struct Session {
    expected: usize,
    data: Vec<u8>,
    next_sn: u8,
    last_us: u64,
}

/// Per-address reassembly state
pub struct Reassembler {
    sessions: HashMap<u32, Session>,
    timeout_us: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_timeout_us(DEFAULT_TIMEOUT_US)
    }

    pub fn with_timeout_us(timeout_us: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout_us,
        }
    }

    /// Feed one frame; returns a message once it is complete
    pub fn push(&mut self, frame: &Frame) -> Result<Option<IsoTpMessage>, IsoTpError> {
        let payload = frame.payload();
        let address = frame.id();
        let &pci = payload
            .first()
            .ok_or(IsoTpError::InvalidLength { kind: PciType::Single, length: 0 })?;

        match PciType::of(payload).ok_or(IsoTpError::InvalidPci(pci))? {
            PciType::Single => {
                let length = usize::from(pci & 0x0F);
                if length == 0 || length > payload.len() - 1 {
                    return Err(IsoTpError::InvalidLength { kind: PciType::Single, length });
                }
                if self.sessions.remove(&address).is_some() {
                    debug!("Single frame from {:03X} aborted a pending reassembly", address);
                }
                Ok(Some(IsoTpMessage {
                    address,
                    data: payload[1..=length].to_vec(),
                    timestamp_us: frame.timestamp_us(),
                }))
            }
            PciType::First => {
                if payload.len() < 2 {
                    return Err(IsoTpError::InvalidLength { kind: PciType::First, length: 0 });
                }
                let expected = (usize::from(pci & 0x0F) << 8) | usize::from(payload[1]);
                if expected < 8 {
                    return Err(IsoTpError::InvalidLength { kind: PciType::First, length: expected });
                }
                let mut data = Vec::with_capacity(expected);
                data.extend_from_slice(&payload[2..]);
                self.sessions.insert(
                    address,
                    Session {
                        expected,
                        data,
                        next_sn: 1,
                        last_us: frame.timestamp_us(),
                    },
                );
                Ok(None)
            }
            PciType::Consecutive => self.consecutive(frame, pci & 0x0F),
            PciType::FlowControl => Ok(None),
        }
    }

    fn consecutive(&mut self, frame: &Frame, sn: u8) -> Result<Option<IsoTpMessage>, IsoTpError> {
        let address = frame.id();
        let session = self
            .sessions
            .get_mut(&address)
            .ok_or(IsoTpError::UnexpectedConsecutive { address })?;

        if frame.timestamp_us().saturating_sub(session.last_us) > self.timeout_us {
            self.sessions.remove(&address);
            return Err(IsoTpError::Timeout { address });
        }
        if sn != session.next_sn {
            let expected = session.next_sn;
            self.sessions.remove(&address);
            return Err(IsoTpError::SequenceMismatch { address, expected, actual: sn });
        }

        session.data.extend_from_slice(&frame.payload()[1..]);
        session.next_sn = (session.next_sn + 1) & 0x0F;
        session.last_us = frame.timestamp_us();

        if session.data.len() < session.expected {
            return Ok(None);
        }

        let mut session = match self.sessions.remove(&address) {
            Some(session) => session,
            None => return Ok(None),
        };
        session.data.truncate(session.expected);
        Ok(Some(IsoTpMessage {
            address,
            data: session.data,
            timestamp_us: frame.timestamp_us(),
        }))
    }

    /// Reassemblies currently in progress
    pub fn in_progress(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a message into padded 8-byte frames
pub fn segment(data: &[u8]) -> Result<Vec<[u8; 8]>, IsoTpError> {
    if data.is_empty() || data.len() > MAX_MESSAGE_LEN {
        return Err(IsoTpError::Unsegmentable(data.len()));
    }

    if data.len() <= 7 {
        let mut frame = [PADDING; 8];
        frame[0] = data.len() as u8;
        frame[1..=data.len()].copy_from_slice(data);
        return Ok(vec![frame]);
    }

    let mut frames = Vec::with_capacity(1 + (data.len() - 6).div_ceil(7));
    let mut first = [PADDING; 8];
    first[0] = 0x10 | ((data.len() >> 8) as u8 & 0x0F);
    first[1] = (data.len() & 0xFF) as u8;
    first[2..].copy_from_slice(&data[..6]);
    frames.push(first);

    for (i, chunk) in data[6..].chunks(7).enumerate() {
        let mut frame = [PADDING; 8];
        frame[0] = 0x20 | ((i + 1) as u8 & 0x0F);
        frame[1..=chunk.len()].copy_from_slice(chunk);
        frames.push(frame);
    }
    Ok(frames)
}

/// Continue-to-send flow control with no block limit or separation time
pub fn flow_control() -> [u8; 8] {
    [0x30, 0x00, 0x00, PADDING, PADDING, PADDING, PADDING, PADDING]
}
