//! Pre-decode validation of UDS messages

use crate::service;
use crate::RESPONSE_OFFSET;
use obd_protocol::{DecodeError, LengthRange};
use tracing::{debug, warn};

/// ISO-TP (ISO 15765-2) classic payload ceiling
pub const MAX_MESSAGE_LEN: usize = 4095;

/// Direction and service of a message that passed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHeader {
    /// Requested service, with the response offset removed
    pub service_id: u8,
    pub is_response: bool,
    /// 0x7F message; `service_id` is the rejected service
    pub is_negative: bool,
}

/// Checks service identifier and per-service length bounds
#[derive(Debug, Default, Clone)]
pub struct Validator {
    _private: (),
}

impl Validator {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Validate a complete message (service byte first)
    pub fn validate(&self, bytes: &[u8]) -> Result<ServiceHeader, DecodeError> {
        let &first = bytes
            .first()
            .ok_or_else(|| DecodeError::InvalidMessage("empty message".into()))?;

        if bytes.len() > MAX_MESSAGE_LEN {
            return Err(DecodeError::InvalidLength {
                expected: LengthRange::between(1, MAX_MESSAGE_LEN),
                actual: bytes.len(),
            });
        }

        let header = if first == service::NEGATIVE_RESPONSE {
            let header = ServiceHeader {
                service_id: bytes.get(1).copied().unwrap_or(0),
                is_response: true,
                is_negative: true,
            };
            check_length(bytes, LengthRange::exact(3))?;
            header
        } else {
            let is_response = first & RESPONSE_OFFSET != 0;
            let service_id = if is_response { first & !RESPONSE_OFFSET } else { first };
            if !service::is_known(service_id) {
                return Err(DecodeError::InvalidMessage(format!(
                    "unknown service identifier {:02X}",
                    first
                )));
            }
            check_length(bytes, length_bounds(service_id, is_response))?;
            ServiceHeader {
                service_id,
                is_response,
                is_negative: false,
            }
        };

        if header.is_negative {
            debug!(
                "Negative response for {}",
                service::name(header.service_id)
            );
        }
        Ok(header)
    }

    /// Log a rejected message with its raw payload in hex
    pub fn log_invalid(&self, bytes: &[u8], address: u32, error: &DecodeError) {
        warn!(
            "Invalid UDS message from {:03X}: {} (payload: {})",
            address,
            error,
            hex::encode_upper(bytes)
        );
    }
}

fn check_length(bytes: &[u8], bounds: LengthRange) -> Result<(), DecodeError> {
    if bounds.contains(bytes.len()) {
        Ok(())
    } else {
        Err(DecodeError::InvalidLength {
            expected: bounds,
            actual: bytes.len(),
        })
    }
}

/// Permitted total message length (service byte included)
pub fn length_bounds(service_id: u8, is_response: bool) -> LengthRange {
    use service::*;

    let open = |min| LengthRange::between(min, MAX_MESSAGE_LEN);
    match (service_id, is_response) {
        (TESTER_PRESENT, _) => LengthRange::exact(2),
        (DIAGNOSTIC_SESSION_CONTROL, false) => LengthRange::exact(2),
        // Response carries P2 and P2* timing after the session type
        (DIAGNOSTIC_SESSION_CONTROL, true) => LengthRange::between(2, 6),
        (ECU_RESET, false) => LengthRange::exact(2),
        (ECU_RESET, true) => LengthRange::between(2, 3),
        (CLEAR_DIAGNOSTIC_INFORMATION, false) => LengthRange::between(4, 5),
        (CLEAR_DIAGNOSTIC_INFORMATION, true) => LengthRange::exact(1),
        (READ_DTC_INFORMATION, _) => open(2),
        (READ_DATA_BY_IDENTIFIER, false) => open(3),
        (READ_DATA_BY_IDENTIFIER, true) => open(4),
        (WRITE_DATA_BY_IDENTIFIER, false) => open(4),
        (WRITE_DATA_BY_IDENTIFIER, true) => LengthRange::exact(3),
        (SECURITY_ACCESS, _) | (CONTROL_DTC_SETTING, _) | (LINK_CONTROL, _) => open(2),
        (COMMUNICATION_CONTROL, false) => open(3),
        (ROUTINE_CONTROL, false) => open(4),
        (ROUTINE_CONTROL, true) => open(4),
        _ => open(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tester_present() {
        let header = Validator::new().validate(&[0x3E, 0x00]).unwrap();
        assert_eq!(header.service_id, 0x3E);
        assert!(!header.is_response);
    }

    #[test]
    fn test_tester_present_requires_exact_length() {
        let validator = Validator::new();
        assert!(validator.validate(&[0x3E]).is_err());
        assert!(validator.validate(&[0x3E, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_empty_message() {
        assert!(matches!(
            Validator::new().validate(&[]),
            Err(DecodeError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_unknown_service() {
        assert!(matches!(
            Validator::new().validate(&[0xFF, 0x00]),
            Err(DecodeError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_too_short() {
        let validator = Validator::new();
        assert!(matches!(
            validator.validate(&[0x19]),
            Err(DecodeError::InvalidLength { .. })
        ));
        // Missing second byte of the data identifier
        assert!(matches!(
            validator.validate(&[0x22, 0xF1]),
            Err(DecodeError::InvalidLength { .. })
        ));
        assert!(validator.validate(&[0x22, 0xF1, 0x90]).is_ok());
    }

    #[test]
    fn test_negative_response() {
        let header = Validator::new().validate(&[0x7F, 0x22, 0x11]).unwrap();
        assert!(header.is_negative);
        assert!(header.is_response);
        assert_eq!(header.service_id, 0x22);

        assert!(Validator::new().validate(&[0x7F, 0x22]).is_err());
    }

    #[test]
    fn test_high_range_services() {
        let validator = Validator::new();
        // 0x85 request and its 0xC5 positive response
        assert!(!validator.validate(&[0x85, 0x01]).unwrap().is_response);
        let header = validator.validate(&[0xC5, 0x01]).unwrap();
        assert!(header.is_response);
        assert_eq!(header.service_id, 0x85);
    }

    #[test]
    fn test_oversized_message() {
        let bytes = vec![0x22; MAX_MESSAGE_LEN + 1];
        assert!(matches!(
            Validator::new().validate(&bytes),
            Err(DecodeError::InvalidLength { .. })
        ));
    }
}
