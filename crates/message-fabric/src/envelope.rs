//! Envelope and payload model

use obd_protocol::{FaultRecord, ParameterReading};
use ring_buffer::Frame;
use serde::{Deserialize, Serialize};
use uds_protocol::DiagnosticMessage;

/// Pipeline stage that produced an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Router,
    UdsDecoder,
    ObdDecoder,
    OfflineBuffer,
}

/// Discriminant of [`Payload`], for logging and stats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    RawFrame,
    Diagnostic,
    Parameter,
    StoredFaults,
    Batch,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::RawFrame => "raw_frame",
            EnvelopeKind::Diagnostic => "diagnostic",
            EnvelopeKind::Parameter => "parameter",
            EnvelopeKind::StoredFaults => "stored_faults",
            EnvelopeKind::Batch => "batch",
        }
    }
}

/// Closed set of things that move between stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Frame(Frame),
    Diagnostic(DiagnosticMessage),
    Parameter(ParameterReading),
    /// OBD-II Mode 03/07/0A result
    StoredFaults {
        address: u32,
        mode: u8,
        faults: Vec<FaultRecord>,
    },
    Batch(Batch),
}

/// Unit of transfer between stages. Moved through queues, never shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonic receipt time of the underlying frame(s), microseconds
    pub timestamp_us: u64,
    pub stage: Stage,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(stage: Stage, timestamp_us: u64, payload: Payload) -> Self {
        Self {
            timestamp_us,
            stage,
            payload,
        }
    }

    /// Envelope carrying a raw frame, stamped with the frame's receipt time
    pub fn frame(stage: Stage, frame: Frame) -> Self {
        Self::new(stage, frame.timestamp_us(), Payload::Frame(frame))
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.payload {
            Payload::Frame(_) => EnvelopeKind::RawFrame,
            Payload::Diagnostic(_) => EnvelopeKind::Diagnostic,
            Payload::Parameter(_) => EnvelopeKind::Parameter,
            Payload::StoredFaults { .. } => EnvelopeKind::StoredFaults,
            Payload::Batch(_) => EnvelopeKind::Batch,
        }
    }
}

/// Ordered group of envelopes sealed by the offline buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub sequence: u64,
    /// Wall-clock open and seal times, Unix milliseconds
    pub opened_at_ms: u64,
    pub sealed_at_ms: u64,
    pub envelopes: Vec<Envelope>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::ParameterDecoder;

    #[test]
    fn test_kind_follows_payload() {
        let frame = Frame::standard(0x7E8, &[0x03, 0x41, 0x0D, 0x55], 42).unwrap();
        let envelope = Envelope::frame(Stage::Router, frame);
        assert_eq!(envelope.kind(), EnvelopeKind::RawFrame);
        assert_eq!(envelope.timestamp_us, 42);

        let reading = ParameterDecoder::new().decode(0x01, 0x0D, &[0x55]).unwrap();
        let envelope = Envelope::new(Stage::ObdDecoder, 43, Payload::Parameter(reading));
        assert_eq!(envelope.kind(), EnvelopeKind::Parameter);
        assert_eq!(envelope.kind().as_str(), "parameter");
    }

    #[test]
    fn test_batch_postcard_encoding() {
        let reading = ParameterDecoder::new().decode(0x01, 0x0C, &[0x27, 0x10]).unwrap();
        let batch = Batch {
            sequence: 7,
            opened_at_ms: 1_700_000_000_000,
            sealed_at_ms: 1_700_000_005_000,
            envelopes: vec![
                Envelope::new(Stage::ObdDecoder, 1, Payload::Parameter(reading)),
                Envelope::new(
                    Stage::ObdDecoder,
                    2,
                    Payload::StoredFaults { address: 0x7E8, mode: 0x03, faults: vec![] },
                ),
            ],
        };

        let bytes = postcard::to_allocvec(&batch).unwrap();
        let restored: Batch = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(restored, batch);
    }
}
