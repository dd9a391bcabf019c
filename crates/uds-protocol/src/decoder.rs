//! Diagnostic-Service Decoder

use crate::service::{self, dtc_report};
use crate::validator::{ServiceHeader, Validator};
use crate::{nrc, SUPPRESS_POSITIVE_RESPONSE};
use obd_protocol::{DecodeError, FaultRecord, LengthRange};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A validated and decoded UDS message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticMessage {
    /// Requested service identifier (response offset removed)
    pub service_id: u8,
    pub sub_function: Option<u8>,
    /// Bus identifier the message arrived on
    pub address: u32,
    pub is_response: bool,
    pub body: ServiceBody,
}

/// Service-specific content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceBody {
    SessionControl {
        session_type: u8,
        /// P2server_max from a positive response
        p2_max_ms: Option<u16>,
        /// P2*server_max from a positive response
        p2_star_max_ms: Option<u32>,
    },
    FaultCodes {
        /// Status mask (request) or availability mask (response)
        status_mask: Option<u8>,
        records: Vec<FaultRecord>,
    },
    FaultCount {
        status_mask: u8,
        format: u8,
        count: u16,
    },
    DataIdentifier {
        identifier: u16,
        value: Vec<u8>,
        /// ASCII rendering for text identifiers such as the VIN
        text: Option<String>,
    },
    KeepAlive {
        suppress_response: bool,
    },
    Negative {
        code: u8,
    },
    /// Known service without a dedicated decoder
    Unrecognized {
        data: Vec<u8>,
    },
}

impl DiagnosticMessage {
    pub fn service_name(&self) -> &'static str {
        service::name(self.service_id)
    }

    /// Fault records carried by the message (empty for other services)
    pub fn faults(&self) -> &[FaultRecord] {
        match &self.body {
            ServiceBody::FaultCodes { records, .. } => records.as_slice(),
            _ => &[],
        }
    }

    /// Identifier and raw value for identifier read/write messages
    pub fn identifier_payload(&self) -> Option<(u16, &[u8])> {
        match &self.body {
            ServiceBody::DataIdentifier {
                identifier, value, ..
            } => Some((*identifier, value.as_slice())),
            _ => None,
        }
    }

    /// ASCII rendering of a text identifier's value
    pub fn identifier_text(&self) -> Option<&str> {
        match &self.body {
            ServiceBody::DataIdentifier { text: Some(text), .. } => Some(text.as_str()),
            _ => None,
        }
    }

    /// Decoded VIN, when this is a VIN read response
    pub fn vin(&self) -> Option<&str> {
        match &self.body {
            ServiceBody::DataIdentifier {
                identifier: service::VIN_IDENTIFIER,
                text: Some(text),
                ..
            } if self.is_response => Some(text.as_str()),
            _ => None,
        }
    }

    /// Name of the negative response code, for 0x7F messages
    pub fn negative_reason(&self) -> Option<&'static str> {
        match self.body {
            ServiceBody::Negative { code } => Some(nrc::name(code)),
            _ => None,
        }
    }
}

/// Validates, then decodes, complete UDS messages
#[derive(Debug, Default)]
pub struct ServiceDecoder {
    validator: Validator,
}

impl ServiceDecoder {
    pub fn new() -> Self {
        info!("Initialized UDS decoder ({} services)", service::KNOWN.len());
        Self {
            validator: Validator::new(),
        }
    }

    /// Decode one message received from `address`.
    ///
    /// Invalid input is logged with its hex payload before the error is
    /// returned; callers simply skip to the next message.
    pub fn decode(&self, bytes: &[u8], address: u32) -> Result<DiagnosticMessage, DecodeError> {
        let result = self
            .validator
            .validate(bytes)
            .and_then(|header| decode_validated(header, bytes, address));

        if let Err(ref error) = result {
            self.validator.log_invalid(bytes, address, error);
        }
        result
    }
}

fn decode_validated(
    header: ServiceHeader,
    bytes: &[u8],
    address: u32,
) -> Result<DiagnosticMessage, DecodeError> {
    let mut message = DiagnosticMessage {
        service_id: header.service_id,
        sub_function: None,
        address,
        is_response: header.is_response,
        body: ServiceBody::Unrecognized { data: Vec::new() },
    };

    if header.is_negative {
        message.body = ServiceBody::Negative { code: bytes[2] };
        debug!(
            "{} rejected by {:03X}: {}",
            service::name(header.service_id),
            address,
            nrc::name(bytes[2])
        );
        return Ok(message);
    }

    let body = &bytes[1..];
    message.body = match header.service_id {
        service::DIAGNOSTIC_SESSION_CONTROL => {
            message.sub_function = Some(body[0] & !SUPPRESS_POSITIVE_RESPONSE);
            decode_session(body)
        }
        service::READ_DTC_INFORMATION => {
            let sub_function = body[0] & !SUPPRESS_POSITIVE_RESPONSE;
            message.sub_function = Some(sub_function);
            decode_dtc_information(sub_function, &body[1..], header.is_response)?
        }
        service::READ_DATA_BY_IDENTIFIER | service::WRITE_DATA_BY_IDENTIFIER => {
            decode_identifier(body)?
        }
        service::TESTER_PRESENT => {
            message.sub_function = Some(body[0] & !SUPPRESS_POSITIVE_RESPONSE);
            ServiceBody::KeepAlive {
                suppress_response: body[0] & SUPPRESS_POSITIVE_RESPONSE != 0,
            }
        }
        _ => ServiceBody::Unrecognized {
            data: body.to_vec(),
        },
    };

    debug!(
        "Decoded {} {} from {:03X}",
        message.service_name(),
        if message.is_response { "response" } else { "request" },
        address
    );
    Ok(message)
}

fn decode_session(body: &[u8]) -> ServiceBody {
    let session_type = body[0] & !SUPPRESS_POSITIVE_RESPONSE;
    let (p2_max_ms, p2_star_max_ms) = match body {
        [_, p2_hi, p2_lo, star_hi, star_lo] => (
            Some(u16::from_be_bytes([*p2_hi, *p2_lo])),
            // P2* is encoded in 10 ms units
            Some(u32::from(u16::from_be_bytes([*star_hi, *star_lo])) * 10),
        ),
        _ => (None, None),
    };
    ServiceBody::SessionControl {
        session_type,
        p2_max_ms,
        p2_star_max_ms,
    }
}

fn decode_dtc_information(
    sub_function: u8,
    rest: &[u8],
    is_response: bool,
) -> Result<ServiceBody, DecodeError> {
    if !is_response {
        return Ok(ServiceBody::FaultCodes {
            status_mask: rest.first().copied(),
            records: Vec::new(),
        });
    }

    if sub_function == dtc_report::NUMBER_OF_DTC_BY_STATUS_MASK {
        return match rest {
            [status_mask, format, hi, lo] => Ok(ServiceBody::FaultCount {
                status_mask: *status_mask,
                format: *format,
                count: u16::from_be_bytes([*hi, *lo]),
            }),
            _ => Err(DecodeError::InvalidLength {
                expected: LengthRange::exact(6),
                actual: rest.len() + 2,
            }),
        };
    }

    if !dtc_report::lists_records(sub_function) {
        return Ok(ServiceBody::Unrecognized {
            data: rest.to_vec(),
        });
    }

    // Availability mask precedes the records when present
    let (status_mask, records) = match rest.len() % 4 {
        0 => (None, rest),
        1 => (Some(rest[0]), &rest[1..]),
        _ => {
            return Err(DecodeError::InvalidFormat(format!(
                "{} trailing bytes after DTC records",
                rest.len() % 4
            )))
        }
    };

    let records = records
        .chunks_exact(4)
        .map(|r| FaultRecord::from_uds_record([r[0], r[1], r[2], r[3]]))
        .collect();

    Ok(ServiceBody::FaultCodes {
        status_mask,
        records,
    })
}

fn decode_identifier(body: &[u8]) -> Result<ServiceBody, DecodeError> {
    let (id_bytes, value) = body.split_at(2);
    let identifier = u16::from_be_bytes([id_bytes[0], id_bytes[1]]);

    let text = if service::ASCII_IDENTIFIERS.contains(&identifier) && !value.is_empty() {
        Some(ascii_text(value).ok_or_else(|| {
            DecodeError::InvalidFormat(format!(
                "identifier {:04X} value is not printable ASCII",
                identifier
            ))
        })?)
    } else {
        None
    };

    Ok(ServiceBody::DataIdentifier {
        identifier,
        value: value.to_vec(),
        text,
    })
}

/// Printable ASCII with trailing NUL/space padding removed
fn ascii_text(value: &[u8]) -> Option<String> {
    let end = value
        .iter()
        .rposition(|b| *b != 0x00 && *b != b' ')
        .map_or(0, |i| i + 1);
    let trimmed = &value[..end];
    if trimmed.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        Some(String::from_utf8_lossy(trimmed).into_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::Severity;

    const ECU: u32 = 0x7E8;

    #[test]
    fn test_tester_present_request() {
        let message = ServiceDecoder::new().decode(&[0x3E, 0x00], 0x7E0).unwrap();
        assert_eq!(message.service_id, 0x3E);
        assert_eq!(message.service_name(), "TesterPresent");
        assert!(!message.is_response);
        assert_eq!(message.address, 0x7E0);
        assert_eq!(
            message.body,
            ServiceBody::KeepAlive { suppress_response: false }
        );
    }

    #[test]
    fn test_tester_present_response() {
        let message = ServiceDecoder::new().decode(&[0x7E, 0x00], ECU).unwrap();
        assert_eq!(message.service_id, 0x3E);
        assert!(message.is_response);
    }

    #[test]
    fn test_tester_present_suppressed() {
        let message = ServiceDecoder::new().decode(&[0x3E, 0x80], 0x7E0).unwrap();
        assert_eq!(message.sub_function, Some(0x00));
        assert_eq!(message.body, ServiceBody::KeepAlive { suppress_response: true });
    }

    #[test]
    fn test_read_identifier_request() {
        let message = ServiceDecoder::new().decode(&[0x22, 0xF1, 0x90], 0x7E0).unwrap();
        assert_eq!(message.identifier_payload(), Some((0xF190, &[][..])));
        assert!(!message.is_response);
        assert_eq!(message.vin(), None);
    }

    #[test]
    fn test_read_identifier_vin_response() {
        let mut bytes = vec![0x62, 0xF1, 0x90];
        bytes.extend_from_slice(b"1HGBH41JXMN109186");
        let message = ServiceDecoder::new().decode(&bytes, ECU).unwrap();

        assert!(message.is_response);
        assert_eq!(message.vin(), Some("1HGBH41JXMN109186"));
        let (identifier, value) = message.identifier_payload().unwrap();
        assert_eq!(identifier, 0xF190);
        assert_eq!(value.len(), 17);
    }

    #[test]
    fn test_serial_number_text() {
        let mut bytes = vec![0x62, 0xF1, 0x8C];
        bytes.extend_from_slice(b"SN-0042");
        let message = ServiceDecoder::new().decode(&bytes, ECU).unwrap();
        assert_eq!(message.identifier_text(), Some("SN-0042"));
        assert_eq!(message.vin(), None);
    }

    #[test]
    fn test_non_text_identifier_keeps_raw_value() {
        let message = ServiceDecoder::new()
            .decode(&[0x62, 0x01, 0x0C, 0x1A, 0xF8], ECU)
            .unwrap();
        match message.body {
            ServiceBody::DataIdentifier { identifier, value, text } => {
                assert_eq!(identifier, 0x010C);
                assert_eq!(value, vec![0x1A, 0xF8]);
                assert_eq!(text, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dtc_request() {
        let message = ServiceDecoder::new().decode(&[0x19, 0x02, 0xFF], 0x7E0).unwrap();
        assert_eq!(message.sub_function, Some(0x02));
        assert_eq!(
            message.body,
            ServiceBody::FaultCodes { status_mask: Some(0xFF), records: vec![] }
        );
    }

    #[test]
    fn test_dtc_response_two_records() {
        let bytes = [
            0x59, 0x02, // response to 0x19, reportDTCByStatusMask
            0xFF, // availability mask
            0x03, 0x01, 0x00, 0x09, // P0301, confirmed + failed
            0x04, 0x20, 0x00, 0x8A, // P0420, lamp + confirmed + failed this cycle
        ];
        let message = ServiceDecoder::new().decode(&bytes, ECU).unwrap();
        let faults = message.faults();

        assert_eq!(faults.len(), 2);
        assert_eq!(faults[0].code, "P0301");
        assert_eq!(faults[0].status, Some(0x09));
        assert_eq!(faults[0].severity, Severity::Medium);
        assert_eq!(faults[1].code, "P0420");
        assert_eq!(faults[1].status, Some(0x8A));
        assert_eq!(faults[1].severity, Severity::Critical);
    }

    #[test]
    fn test_dtc_response_without_mask() {
        let bytes = [0x59, 0x02, 0x41, 0x23, 0x00, 0x08];
        let message = ServiceDecoder::new().decode(&bytes, ECU).unwrap();
        match &message.body {
            ServiceBody::FaultCodes { status_mask, records } => {
                assert_eq!(*status_mask, None);
                assert_eq!(records[0].code, "C0123");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dtc_response_zero_records_is_valid() {
        let message = ServiceDecoder::new().decode(&[0x59, 0x02, 0xFF], ECU).unwrap();
        assert!(message.faults().is_empty());
        assert!(matches!(message.body, ServiceBody::FaultCodes { .. }));
    }

    #[test]
    fn test_dtc_response_ragged_records() {
        let result = ServiceDecoder::new().decode(&[0x59, 0x02, 0xFF, 0x03, 0x01], ECU);
        assert!(matches!(result, Err(DecodeError::InvalidFormat(_))));
    }

    #[test]
    fn test_dtc_count_response() {
        let message = ServiceDecoder::new()
            .decode(&[0x59, 0x01, 0xFF, 0x01, 0x00, 0x03], ECU)
            .unwrap();
        assert_eq!(
            message.body,
            ServiceBody::FaultCount { status_mask: 0xFF, format: 0x01, count: 3 }
        );
    }

    #[test]
    fn test_session_control_response_timing() {
        let message = ServiceDecoder::new()
            .decode(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4], ECU)
            .unwrap();
        assert_eq!(message.sub_function, Some(0x03));
        assert_eq!(
            message.body,
            ServiceBody::SessionControl {
                session_type: 0x03,
                p2_max_ms: Some(50),
                p2_star_max_ms: Some(5000),
            }
        );
    }

    #[test]
    fn test_negative_response() {
        let message = ServiceDecoder::new().decode(&[0x7F, 0x22, 0x31], ECU).unwrap();
        assert_eq!(message.service_id, 0x22);
        assert!(message.is_response);
        assert_eq!(message.negative_reason(), Some("requestOutOfRange"));
    }

    #[test]
    fn test_known_service_passes_through() {
        let message = ServiceDecoder::new()
            .decode(&[0x31, 0x01, 0xFF, 0x00], 0x7E0)
            .unwrap();
        assert_eq!(message.service_id, 0x31);
        assert_eq!(
            message.body,
            ServiceBody::Unrecognized { data: vec![0x01, 0xFF, 0x00] }
        );
    }

    #[test]
    fn test_invalid_messages() {
        let decoder = ServiceDecoder::new();
        assert!(matches!(decoder.decode(&[], ECU), Err(DecodeError::InvalidMessage(_))));
        assert!(matches!(
            decoder.decode(&[0xFF, 0x00], ECU),
            Err(DecodeError::InvalidMessage(_))
        ));
        assert!(matches!(
            decoder.decode(&[0x3E], ECU),
            Err(DecodeError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_vin_with_padding() {
        let mut bytes = vec![0x62, 0xF1, 0x90];
        bytes.extend_from_slice(b"WVWZZZ1JZXW000001");
        bytes.extend_from_slice(&[0x00, 0x00]);
        let message = ServiceDecoder::new().decode(&bytes, ECU).unwrap();
        assert_eq!(message.vin(), Some("WVWZZZ1JZXW000001"));
    }
}
