//! UDS Protocol Implementation
//!
//! Validates and decodes ISO 14229 diagnostic-service messages after ISO-TP
//! reassembly. Fault records share their normalization with `obd-protocol`.

mod decoder;
pub mod nrc;
pub mod service;
mod validator;

pub use decoder::{DiagnosticMessage, ServiceBody, ServiceDecoder};
pub use obd_protocol::{DecodeError, FaultRecord, LengthRange, Severity};
pub use validator::{ServiceHeader, Validator, MAX_MESSAGE_LEN};

/// Positive responses carry the requested SID plus this offset
pub const RESPONSE_OFFSET: u8 = 0x40;

/// Sub-function bit asking the server not to send a positive response
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;
