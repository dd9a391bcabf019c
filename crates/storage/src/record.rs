//! Offline records and their on-disk encoding

use crate::StorageError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use message_fabric::Batch;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// A sealed, compressed batch as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineRecord {
    pub sequence: u64,
    /// Unix milliseconds when the batch was sealed
    pub created_at_ms: i64,
    pub transmitted: bool,
    /// gzip(postcard(Batch))
    pub data: Vec<u8>,
}

impl OfflineRecord {
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            sequence: self.sequence,
            size_bytes: self.size_bytes(),
            transmitted: self.transmitted,
        }
    }
}

/// Record header without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub sequence: u64,
    pub size_bytes: u64,
    pub transmitted: bool,
}

/// postcard, then gzip
pub fn encode_batch(batch: &Batch) -> Result<Vec<u8>, StorageError> {
    let raw = postcard::to_allocvec(batch)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| StorageError::Compression(e.to_string()))
}

/// Restore the batch a record was built from
pub fn decode_record(record: &OfflineRecord) -> Result<Batch, StorageError> {
    let mut raw = Vec::new();
    GzDecoder::new(record.data.as_slice())
        .read_to_end(&mut raw)
        .map_err(|e| StorageError::Compression(format!("record {}: {}", record.sequence, e)))?;
    Ok(postcard::from_bytes(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_fabric::{Envelope, Payload, Stage};
    use obd_protocol::ParameterDecoder;

    fn batch(sequence: u64, n: usize) -> Batch {
        let decoder = ParameterDecoder::new();
        let envelopes = (0..n)
            .map(|i| {
                let reading = decoder.decode(0x01, 0x0D, &[i as u8]).unwrap();
                Envelope::new(Stage::ObdDecoder, i as u64, Payload::Parameter(reading))
            })
            .collect();
        Batch {
            sequence,
            opened_at_ms: 1_700_000_000_000,
            sealed_at_ms: 1_700_000_005_000,
            envelopes,
        }
    }

    #[test]
    fn test_encode_decode_preserves_order() {
        let original = batch(3, 50);
        let record = OfflineRecord {
            sequence: 3,
            created_at_ms: 0,
            transmitted: false,
            data: encode_batch(&original).unwrap(),
        };

        let restored = decode_record(&record).unwrap();
        assert_eq!(restored, original);
        assert_eq!(&record.data[..2], &[0x1F, 0x8B]);
    }

    #[test]
    fn test_compression_shrinks_repetitive_batches() {
        let original = batch(1, 500);
        let raw = postcard::to_allocvec(&original).unwrap();
        let compressed = encode_batch(&original).unwrap();
        assert!(compressed.len() < raw.len());
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let record = OfflineRecord {
            sequence: 9,
            created_at_ms: 0,
            transmitted: false,
            data: vec![0x00, 0x01, 0x02],
        };
        assert!(matches!(decode_record(&record), Err(StorageError::Compression(_))));
    }
}
