//! Parameter Decoder
//!
//! Turns OBD-II response payloads (PCI already stripped, first byte is the
//! response mode) into readings and fault records.

use crate::dtc::{FaultCode, FaultRecord};
use crate::error::{DecodeError, LengthRange};
use crate::mode;
use crate::pid::{self, ParameterReading};
use tracing::{debug, info};

/// Positive responses carry the requested mode plus this offset
pub const RESPONSE_OFFSET: u8 = 0x40;

/// Decoded OBD-II response
#[derive(Debug, Clone, PartialEq)]
pub enum ObdResponse {
    /// Mode 01/02 value
    Reading(ParameterReading),
    /// Mode 03/07/0A code list
    StoredFaults { mode: u8, faults: Vec<FaultRecord> },
}

/// Stateless SAE J1979 decoder
#[derive(Debug, Default)]
pub struct ParameterDecoder {
    _private: (),
}

impl ParameterDecoder {
    pub fn new() -> Self {
        info!(
            "Initialized OBD-II parameter decoder with {} PIDs",
            pid::PID_TABLE.len()
        );
        Self { _private: () }
    }

    /// Decode the data bytes of a Mode 01/02 response for `pid`.
    ///
    /// The byte count must equal the table width; the input is never
    /// modified and the same bytes always produce the same reading.
    pub fn decode(&self, mode: u8, pid: u8, bytes: &[u8]) -> Result<ParameterReading, DecodeError> {
        if mode != mode::CURRENT_DATA && mode != mode::FREEZE_FRAME {
            return Err(DecodeError::UnsupportedMode(mode));
        }

        let spec = pid::lookup(pid).ok_or(DecodeError::UnsupportedPid { mode, pid })?;
        if bytes.len() != spec.width {
            return Err(DecodeError::length(LengthRange::exact(spec.width), bytes.len()));
        }

        let reading = ParameterReading::from_spec(mode, spec, bytes);
        debug!("Decoded {}: {} {}", reading.name, reading.value, reading.unit);
        Ok(reading)
    }

    /// Decode a stored/pending/permanent fault list.
    ///
    /// CAN responses prefix the list with a count byte, which shows up as an
    /// odd byte total; legacy responses are a bare sequence of 2-byte codes.
    /// All-zero padding codes are skipped.
    pub fn decode_faults(&self, mode: u8, bytes: &[u8]) -> Result<Vec<FaultRecord>, DecodeError> {
        if !mode::is_fault_mode(mode) {
            return Err(DecodeError::UnsupportedMode(mode));
        }

        let codes = if bytes.len() % 2 == 1 {
            let count = usize::from(bytes[0]);
            let available = &bytes[1..];
            if available.len() < count * 2 {
                return Err(DecodeError::length(
                    LengthRange::at_least(1 + count * 2),
                    bytes.len(),
                ));
            }
            &available[..count * 2]
        } else {
            bytes
        };

        let faults: Vec<FaultRecord> = codes
            .chunks_exact(2)
            .map(|pair| FaultCode::from_bytes(pair[0], pair[1]))
            .filter(|code| !code.is_empty())
            .map(FaultRecord::from_obd_code)
            .collect();

        debug!("Decoded {} stored DTCs (mode {:02X})", faults.len(), mode);
        Ok(faults)
    }

    /// Decode a complete response payload starting at the response mode byte
    pub fn decode_response(&self, payload: &[u8]) -> Result<ObdResponse, DecodeError> {
        let (&sid, rest) = payload
            .split_first()
            .ok_or_else(|| DecodeError::InvalidMessage("empty OBD-II payload".into()))?;

        if !is_response_sid(sid) {
            return Err(DecodeError::InvalidMessage(format!(
                "{:02X} is not an OBD-II response mode",
                sid
            )));
        }
        let mode = sid - RESPONSE_OFFSET;

        match mode {
            mode::CURRENT_DATA => {
                let (&pid, data) = rest
                    .split_first()
                    .ok_or_else(|| DecodeError::length(LengthRange::at_least(2), payload.len()))?;
                self.decode(mode, pid, data).map(ObdResponse::Reading)
            }
            mode::FREEZE_FRAME => {
                // 42 PID FRAME data...
                if rest.len() < 2 {
                    return Err(DecodeError::length(LengthRange::at_least(3), payload.len()));
                }
                self.decode(mode, rest[0], &rest[2..]).map(ObdResponse::Reading)
            }
            m if mode::is_fault_mode(m) => Ok(ObdResponse::StoredFaults {
                mode: m,
                faults: self.decode_faults(m, rest)?,
            }),
            other => Err(DecodeError::UnsupportedMode(other)),
        }
    }
}

/// True for positive responses to modes 01 to 0A
pub fn is_response_sid(sid: u8) -> bool {
    (RESPONSE_OFFSET + mode::CURRENT_DATA..=RESPONSE_OFFSET + mode::PERMANENT_DTC).contains(&sid)
}
