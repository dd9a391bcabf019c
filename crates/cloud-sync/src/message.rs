//! Broker payloads

use chrono::{DateTime, TimeZone, Utc};
use message_fabric::{Batch, Payload};
use obd_protocol::{DtcCategory, FaultRecord, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Latest value of one parameter within a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingEntry {
    pub timestamp_us: u64,
    pub mode: u8,
    pub pid: u8,
    pub name: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultEntry {
    pub timestamp_us: u64,
    /// "uds" or "obd"
    pub source: String,
    pub address: u32,
    pub code: String,
    pub category: DtcCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u8>,
    pub severity: Severity,
}

/// Data identifier read from an ECU, e.g. the VIN
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierEntry {
    pub timestamp_us: u64,
    pub address: u32,
    pub identifier: u16,
    /// Raw value, hex encoded
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One published batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub message_id: Uuid,
    pub vin: String,
    pub timestamp: DateTime<Utc>,
    pub telemetry_type: String,
    pub sequence: u64,
    pub data: BTreeMap<String, ParameterValue>,
    pub readings: Vec<ReadingEntry>,
    pub faults: Vec<FaultEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<IdentifierEntry>,
}

impl TelemetryMessage {
    pub fn from_batch(batch: &Batch, vin: &str) -> Self {
        let mut data = BTreeMap::new();
        let mut readings = Vec::new();
        let mut faults = Vec::new();
        let mut identifiers = Vec::new();

        for envelope in &batch.envelopes {
            let ts = envelope.timestamp_us;
            match &envelope.payload {
                Payload::Parameter(reading) => {
                    data.insert(
                        reading.name.clone(),
                        ParameterValue {
                            value: reading.value,
                            unit: reading.unit.clone(),
                        },
                    );
                    readings.push(ReadingEntry {
                        timestamp_us: ts,
                        mode: reading.mode,
                        pid: reading.pid,
                        name: reading.name.clone(),
                        value: reading.value,
                        unit: reading.unit.clone(),
                    });
                }
                Payload::StoredFaults {
                    address, faults: records, ..
                } => {
                    faults.extend(records.iter().map(|f| FaultEntry::new(ts, "obd", *address, f)));
                }
                Payload::Diagnostic(message) => {
                    faults.extend(
                        message
                            .faults()
                            .iter()
                            .map(|f| FaultEntry::new(ts, "uds", message.address, f)),
                    );
                    if message.is_response {
                        if let Some((identifier, value)) = message.identifier_payload() {
                            identifiers.push(IdentifierEntry {
                                timestamp_us: ts,
                                address: message.address,
                                identifier,
                                value: hex::encode_upper(value),
                                text: message.identifier_text().map(str::to_string),
                            });
                        }
                    }
                }
                // Raw frames and nested batches are not forwarded
                Payload::Frame(_) | Payload::Batch(_) => {}
            }
        }

        Self {
            message_id: Uuid::new_v4(),
            vin: vin.to_string(),
            timestamp: timestamp_from_ms(batch.sealed_at_ms),
            telemetry_type: "batch".to_string(),
            sequence: batch.sequence,
            data,
            readings,
            faults,
            identifiers,
        }
    }
}

impl FaultEntry {
    fn new(timestamp_us: u64, source: &str, address: u32, record: &FaultRecord) -> Self {
        Self {
            timestamp_us,
            source: source.to_string(),
            address,
            code: record.code.clone(),
            category: record.category,
            failure_type: record.failure_type,
            status: record.status,
            severity: record.severity,
        }
    }
}

/// Counters carried in liveness announcements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherCounters {
    pub published: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub reconnects: u64,
    pub skipped: u64,
    pub pending: usize,
}

/// Liveness announcement on the status topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub gateway_id: String,
    pub vin: String,
    pub status: String,
    pub state: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub stats: PublisherCounters,
}

pub(crate) fn timestamp_from_ms(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_fabric::{Envelope, Stage};
    use obd_protocol::{FaultCode, ParameterDecoder};
    use uds_protocol::ServiceDecoder;

    fn batch(envelopes: Vec<Envelope>) -> Batch {
        Batch {
            sequence: 7,
            opened_at_ms: 1_700_000_000_000,
            sealed_at_ms: 1_700_000_005_000,
            envelopes,
        }
    }

    #[test]
    fn test_readings_keep_order_and_data_keeps_latest() {
        let decoder = ParameterDecoder::new();
        let envelopes = vec![
            Envelope::new(
                Stage::ObdDecoder,
                10,
                Payload::Parameter(decoder.decode(0x01, 0x0D, &[0x40]).unwrap()),
            ),
            Envelope::new(
                Stage::ObdDecoder,
                20,
                Payload::Parameter(decoder.decode(0x01, 0x0D, &[0x50]).unwrap()),
            ),
            Envelope::new(
                Stage::ObdDecoder,
                30,
                Payload::Parameter(decoder.decode(0x01, 0x0C, &[0x27, 0x10]).unwrap()),
            ),
        ];

        let message = TelemetryMessage::from_batch(&batch(envelopes), "VIN123");
        assert_eq!(message.sequence, 7);
        assert_eq!(message.telemetry_type, "batch");
        assert_eq!(message.readings.len(), 3);
        assert_eq!(message.readings[0].timestamp_us, 10);
        assert_eq!(message.readings[1].value, 80.0);
        assert_eq!(message.data["vehicle_speed"].value, 80.0);
        assert_eq!(message.data["engine_rpm"].value, 2500.0);
        assert_eq!(message.data["engine_rpm"].unit, "rpm");
        assert!(message.faults.is_empty());
    }

    #[test]
    fn test_faults_from_both_protocols() {
        let uds = ServiceDecoder::new()
            .decode(&[0x59, 0x02, 0xFF, 0x03, 0x01, 0x00, 0x88], 0x7E8)
            .unwrap();
        let obd_faults = vec![FaultRecord::from_obd_code(FaultCode::from_bytes(0x01, 0x71))];
        let envelopes = vec![
            Envelope::new(Stage::UdsDecoder, 5, Payload::Diagnostic(uds)),
            Envelope::new(
                Stage::ObdDecoder,
                6,
                Payload::StoredFaults {
                    address: 0x7E8,
                    mode: 0x03,
                    faults: obd_faults,
                },
            ),
        ];

        let message = TelemetryMessage::from_batch(&batch(envelopes), "VIN123");
        assert_eq!(message.faults.len(), 2);
        assert_eq!(message.faults[0].source, "uds");
        assert_eq!(message.faults[0].code, "P0301");
        assert_eq!(message.faults[0].status, Some(0x88));
        assert_eq!(message.faults[1].source, "obd");
        assert_eq!(message.faults[1].code, "P0171");
        assert_eq!(message.faults[1].severity, Severity::Unclassified);
    }

    #[test]
    fn test_vin_response_becomes_identifier() {
        let mut bytes = vec![0x62, 0xF1, 0x90];
        bytes.extend_from_slice(b"1HGCM82633A004352");
        let uds = ServiceDecoder::new().decode(&bytes, 0x7E8).unwrap();
        let envelopes = vec![Envelope::new(Stage::UdsDecoder, 1, Payload::Diagnostic(uds))];

        let message = TelemetryMessage::from_batch(&batch(envelopes), "VIN123");
        assert_eq!(message.identifiers.len(), 1);
        assert_eq!(message.identifiers[0].identifier, 0xF190);
        assert_eq!(message.identifiers[0].text.as_deref(), Some("1HGCM82633A004352"));
        assert!(message.identifiers[0].value.starts_with("31484743"));
    }

    #[test]
    fn test_text_identifier_keeps_decoded_text() {
        let mut bytes = vec![0x62, 0xF1, 0x8C];
        bytes.extend_from_slice(b"SN-0042");
        let uds = ServiceDecoder::new().decode(&bytes, 0x7E8).unwrap();
        let envelopes = vec![Envelope::new(Stage::UdsDecoder, 1, Payload::Diagnostic(uds))];

        let message = TelemetryMessage::from_batch(&batch(envelopes), "VIN123");
        assert_eq!(message.identifiers[0].identifier, 0xF18C);
        assert_eq!(message.identifiers[0].text.as_deref(), Some("SN-0042"));
        assert_eq!(message.identifiers[0].value, "534E2D30303432");
    }

    #[test]
    fn test_binary_identifier_has_no_text() {
        let uds = ServiceDecoder::new().decode(&[0x62, 0x01, 0x0C, 0x1A, 0xF8], 0x7E8).unwrap();
        let envelopes = vec![Envelope::new(Stage::UdsDecoder, 1, Payload::Diagnostic(uds))];

        let message = TelemetryMessage::from_batch(&batch(envelopes), "VIN123");
        assert_eq!(message.identifiers[0].value, "1AF8");
        assert_eq!(message.identifiers[0].text, None);
    }

    #[test]
    fn test_json_shape() {
        let decoder = ParameterDecoder::new();
        let envelopes = vec![Envelope::new(
            Stage::ObdDecoder,
            10,
            Payload::Parameter(decoder.decode(0x01, 0x05, &[0x5A]).unwrap()),
        )];
        let message = TelemetryMessage::from_batch(&batch(envelopes), "VIN123");
        let json = serde_json::to_value(&message).unwrap();

        for key in ["messageId", "vin", "timestamp", "telemetryType", "sequence", "data", "readings", "faults"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert!(json.get("identifiers").is_none());
        assert_eq!(json["data"]["coolant_temp"]["value"], 50.0);
        assert_eq!(json["timestamp"], "2023-11-14T22:13:25Z");
        assert_eq!(json["readings"][0]["timestampUs"], 10);
    }
}
