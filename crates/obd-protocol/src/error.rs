//! Decode Error Types

use std::fmt;
use thiserror::Error;

/// Permitted byte count for a message or field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthRange {
    pub min: usize,
    pub max: Option<usize>,
}

impl LengthRange {
    pub const fn exact(len: usize) -> Self {
        Self {
            min: len,
            max: Some(len),
        }
    }

    pub const fn at_least(min: usize) -> Self {
        Self { min, max: None }
    }

    pub const fn between(min: usize, max: usize) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub fn contains(&self, len: usize) -> bool {
        len >= self.min && self.max.map_or(true, |max| len <= max)
    }
}

impl fmt::Display for LengthRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{}", max),
            Some(max) => write!(f, "{} to {}", self.min, max),
            None => write!(f, "at least {}", self.min),
        }
    }
}

/// Errors raised while decoding a diagnostic payload.
///
/// Shared by the parameter and diagnostic-service decoders. None of these
/// are fatal: the caller logs the offending payload and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Structurally unacceptable message (empty, unknown service, wrong direction)
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Byte count outside the permitted bounds
    #[error("Invalid length: got {actual} bytes, expected {expected}")]
    InvalidLength { expected: LengthRange, actual: usize },

    /// Field contents violate the wire format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// PID has no formula table entry
    #[error("PID {pid:02X} not supported in mode {mode:02X}")]
    UnsupportedPid { mode: u8, pid: u8 },

    /// Mode has no decoder
    #[error("Mode {0:02X} not supported")]
    UnsupportedMode(u8),
}

impl DecodeError {
    pub(crate) fn length(expected: LengthRange, actual: usize) -> Self {
        DecodeError::InvalidLength { expected, actual }
    }
}
