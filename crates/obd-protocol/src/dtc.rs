//! Diagnostic Trouble Code Normalization
//!
//! Both wire protocols carry fault codes as the SAE J2012 two-byte form:
//! bits 15..14 select the system letter, the remaining 14 bits are printed
//! as four hex digits. UDS adds a failure-type byte and an ISO 14229-1 status
//! byte, from which severity is derived; OBD-II stored codes carry neither.

use serde::{Deserialize, Serialize};
use std::fmt;

/// DTC status byte bits (ISO 14229-1 DTCStatusMask)
pub mod status_bit {
    pub const TEST_FAILED: u8 = 0x01;
    pub const TEST_FAILED_THIS_OPERATION_CYCLE: u8 = 0x02;
    pub const PENDING_DTC: u8 = 0x04;
    pub const CONFIRMED_DTC: u8 = 0x08;
    pub const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR: u8 = 0x10;
    pub const TEST_FAILED_SINCE_LAST_CLEAR: u8 = 0x20;
    pub const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE: u8 = 0x40;
    pub const WARNING_INDICATOR_REQUESTED: u8 = 0x80;
}

/// System letter of a fault code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    /// P: engine and transmission
    Powertrain,
    /// C: brakes, steering, suspension
    Chassis,
    /// B: cabin and restraint systems
    Body,
    /// U: in-vehicle network
    Network,
}

impl DtcCategory {
    /// Category from bits 7..6 of the first code byte
    pub fn from_high_byte(byte: u8) -> Self {
        match byte >> 6 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub fn prefix(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }
}

/// Two-byte SAE J2012 fault code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultCode(u16);

impl FaultCode {
    pub fn from_bytes(high: u8, low: u8) -> Self {
        Self(u16::from_be_bytes([high, low]))
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn category(&self) -> DtcCategory {
        DtcCategory::from_high_byte((self.0 >> 8) as u8)
    }

    /// All-zero codes are padding in OBD-II stored-fault responses
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:04X}", self.category().prefix(), self.0 & 0x3FFF)
    }
}

/// Severity classification derived from the status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// No status byte available (OBD-II stored codes)
    Unclassified,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Classify an ISO 14229-1 status byte.
    ///
    /// Base level is `Low`. confirmedDTC raises to at least `Medium`,
    /// warningIndicatorRequested to at least `High`, and
    /// testFailedThisOperationCycle escalates the result by one level.
    pub fn from_status(status: u8) -> Self {
        let mut severity = Severity::Low;
        if status & status_bit::CONFIRMED_DTC != 0 {
            severity = severity.max(Severity::Medium);
        }
        if status & status_bit::WARNING_INDICATOR_REQUESTED != 0 {
            severity = severity.max(Severity::High);
        }
        if status & status_bit::TEST_FAILED_THIS_OPERATION_CYCLE != 0 {
            severity = severity.escalate();
        }
        severity
    }

    /// One level up, capped at `Critical`
    pub fn escalate(self) -> Self {
        match self {
            Severity::Unclassified | Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unclassified => "unclassified",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized fault code with its status and severity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Display form, e.g. "P0301"
    pub code: String,
    pub category: DtcCategory,
    /// ISO 14229 failure-type byte (UDS only)
    pub failure_type: Option<u8>,
    /// Raw status byte (UDS only)
    pub status: Option<u8>,
    pub severity: Severity,
}

impl FaultRecord {
    /// Build from a 4-byte UDS record: code high, code low, failure type, status
    pub fn from_uds_record(record: [u8; 4]) -> Self {
        let [high, low, failure_type, status] = record;
        let code = FaultCode::from_bytes(high, low);
        Self {
            code: code.to_string(),
            category: code.category(),
            failure_type: Some(failure_type),
            status: Some(status),
            severity: Severity::from_status(status),
        }
    }

    /// Build from an OBD-II stored code, which carries no status
    pub fn from_obd_code(code: FaultCode) -> Self {
        Self {
            code: code.to_string(),
            category: code.category(),
            failure_type: None,
            status: None,
            severity: Severity::Unclassified,
        }
    }

    /// True when the ECU reports the fault as confirmed
    pub fn is_confirmed(&self) -> bool {
        self.status
            .map_or(false, |s| s & status_bit::CONFIRMED_DTC != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_formatting() {
        assert_eq!(FaultCode::from_bytes(0x03, 0x01).to_string(), "P0301");
        assert_eq!(FaultCode::from_bytes(0x04, 0x20).to_string(), "P0420");
        assert_eq!(FaultCode::from_bytes(0x41, 0x23).to_string(), "C0123");
        assert_eq!(FaultCode::from_bytes(0x92, 0x34).to_string(), "B1234");
        assert_eq!(FaultCode::from_bytes(0xC1, 0x00).to_string(), "U0100");
        // Manufacturer-specific range keeps the leading digit
        assert_eq!(FaultCode::from_bytes(0x31, 0x00).to_string(), "P3100");
    }

    #[test]
    fn test_severity_base_levels() {
        assert_eq!(Severity::from_status(0x00), Severity::Low);
        assert_eq!(Severity::from_status(status_bit::PENDING_DTC), Severity::Low);
        assert_eq!(Severity::from_status(status_bit::CONFIRMED_DTC), Severity::Medium);
        assert_eq!(
            Severity::from_status(status_bit::WARNING_INDICATOR_REQUESTED),
            Severity::High
        );
    }

    #[test]
    fn test_severity_escalation() {
        // Failed this cycle alone: Low -> Medium
        assert_eq!(Severity::from_status(0x02), Severity::Medium);
        // Confirmed + failed this cycle: Medium -> High
        assert_eq!(Severity::from_status(0x0A), Severity::High);
        // Warning lamp + failed this cycle: High -> Critical
        assert_eq!(Severity::from_status(0x82), Severity::Critical);
        assert_eq!(Severity::from_status(0xFF), Severity::Critical);
    }

    #[test]
    fn test_escalate_is_capped() {
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
    }

    #[test]
    fn test_uds_record() {
        let record = FaultRecord::from_uds_record([0x03, 0x01, 0x00, 0x09]);
        assert_eq!(record.code, "P0301");
        assert_eq!(record.status, Some(0x09));
        assert_eq!(record.severity, Severity::Medium);
        assert!(record.is_confirmed());
    }

    #[test]
    fn test_obd_record_is_unclassified() {
        let record = FaultRecord::from_obd_code(FaultCode::from_bytes(0x01, 0x33));
        assert_eq!(record.code, "P0133");
        assert_eq!(record.status, None);
        assert_eq!(record.severity, Severity::Unclassified);
        assert!(!record.is_confirmed());
    }
}
