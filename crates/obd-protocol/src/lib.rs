//! OBD-II Protocol Implementation
//!
//! SAE J1979 parameter decoding over ISO 15765-4 (CAN), plus the SAE J2012
//! fault-code normalization shared with the UDS decoder.

mod decoder;
pub mod dtc;
mod error;
pub mod pid;

pub use decoder::{is_response_sid, ObdResponse, ParameterDecoder, RESPONSE_OFFSET};
pub use dtc::{DtcCategory, FaultCode, FaultRecord, Severity};
pub use error::{DecodeError, LengthRange};
pub use pid::{ParameterReading, PidSpec};

/// Functional (broadcast) request identifier for 11-bit OBD-II
pub const FUNCTIONAL_REQUEST_ID: u32 = 0x7DF;
/// ECU response identifiers for 11-bit OBD-II
pub const RESPONSE_IDS: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;

/// Filler for unused request bytes (ISO 15765-4)
const PADDING: u8 = 0x55;

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes (current or last drive cycle)
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;

    /// Modes whose response is a fault-code list
    pub fn is_fault_mode(mode: u8) -> bool {
        matches!(mode, READ_DTC | PENDING_DTC | PERMANENT_DTC)
    }
}

/// Single-frame request for `mode`/`pid`, padded to 8 bytes
pub fn encode_request(mode: u8, pid: u8) -> [u8; 8] {
    let mut frame = [PADDING; 8];
    frame[..3].copy_from_slice(&[0x02, mode, pid]);
    frame
}

/// Single-frame request for a mode without a PID (e.g. Mode 03)
pub fn encode_mode_request(mode: u8) -> [u8; 8] {
    let mut frame = [PADDING; 8];
    frame[..2].copy_from_slice(&[0x01, mode]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request() {
        assert_eq!(
            encode_request(mode::CURRENT_DATA, 0x0C),
            [0x02, 0x01, 0x0C, 0x55, 0x55, 0x55, 0x55, 0x55]
        );
        assert_eq!(
            encode_mode_request(mode::READ_DTC),
            [0x01, 0x03, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55]
        );
    }

    #[test]
    fn test_response_sid_range() {
        assert!(is_response_sid(0x41));
        assert!(is_response_sid(0x4A));
        assert!(!is_response_sid(0x40));
        assert!(!is_response_sid(0x59));
    }
}
