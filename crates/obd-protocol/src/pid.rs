//! OBD-II PID Definitions and Response Parsing
//!
//! Every supported PID is described by a fixed (width, scale, offset, unit)
//! entry. Decoding is `value = scale * raw + offset` where `raw` is the
//! big-endian integer formed from exactly `width` response bytes.

use serde::{Deserialize, Serialize};

/// Formula table entry for one Mode 01/02 PID
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidSpec {
    pub pid: u8,
    pub name: &'static str,
    /// Response data bytes (1 or 2)
    pub width: usize,
    pub scale: f64,
    pub offset: f64,
    pub unit: &'static str,
}

impl PidSpec {
    /// Big-endian integer from the response bytes
    pub fn raw_value(&self, bytes: &[u8]) -> u32 {
        bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
    }

    /// Engineering value for the response bytes
    pub fn apply(&self, bytes: &[u8]) -> f64 {
        self.scale * f64::from(self.raw_value(bytes)) + self.offset
    }
}

const PERCENT_OF_255: f64 = 100.0 / 255.0;
const FUEL_TRIM_SCALE: f64 = 100.0 / 128.0;

/// SAE J1979 Mode 01 formula table, sorted by PID
pub const PID_TABLE: &[PidSpec] = &[
    PidSpec { pid: 0x04, name: "engine_load", width: 1, scale: PERCENT_OF_255, offset: 0.0, unit: "percent" },
    PidSpec { pid: 0x05, name: "coolant_temp", width: 1, scale: 1.0, offset: -40.0, unit: "celsius" },
    PidSpec { pid: 0x06, name: "short_term_fuel_trim_bank1", width: 1, scale: FUEL_TRIM_SCALE, offset: -100.0, unit: "percent" },
    PidSpec { pid: 0x07, name: "long_term_fuel_trim_bank1", width: 1, scale: FUEL_TRIM_SCALE, offset: -100.0, unit: "percent" },
    PidSpec { pid: 0x0B, name: "intake_manifold_pressure", width: 1, scale: 1.0, offset: 0.0, unit: "kPa" },
    PidSpec { pid: 0x0C, name: "engine_rpm", width: 2, scale: 0.25, offset: 0.0, unit: "rpm" },
    PidSpec { pid: 0x0D, name: "vehicle_speed", width: 1, scale: 1.0, offset: 0.0, unit: "km/h" },
    PidSpec { pid: 0x0E, name: "timing_advance", width: 1, scale: 0.5, offset: -64.0, unit: "degrees" },
    PidSpec { pid: 0x0F, name: "intake_air_temp", width: 1, scale: 1.0, offset: -40.0, unit: "celsius" },
    PidSpec { pid: 0x10, name: "maf_flow_rate", width: 2, scale: 0.01, offset: 0.0, unit: "g/s" },
    PidSpec { pid: 0x11, name: "throttle_position", width: 1, scale: PERCENT_OF_255, offset: 0.0, unit: "percent" },
    PidSpec { pid: 0x1F, name: "run_time_since_start", width: 2, scale: 1.0, offset: 0.0, unit: "seconds" },
    PidSpec { pid: 0x2F, name: "fuel_level", width: 1, scale: PERCENT_OF_255, offset: 0.0, unit: "percent" },
    PidSpec { pid: 0x33, name: "barometric_pressure", width: 1, scale: 1.0, offset: 0.0, unit: "kPa" },
    PidSpec { pid: 0x42, name: "control_module_voltage", width: 2, scale: 0.001, offset: 0.0, unit: "volts" },
    PidSpec { pid: 0x46, name: "ambient_air_temp", width: 1, scale: 1.0, offset: -40.0, unit: "celsius" },
    PidSpec { pid: 0x5C, name: "engine_oil_temp", width: 1, scale: 1.0, offset: -40.0, unit: "celsius" },
];

/// Look up the formula table entry for a PID
pub fn lookup(pid: u8) -> Option<&'static PidSpec> {
    PID_TABLE
        .binary_search_by_key(&pid, |spec| spec.pid)
        .ok()
        .map(|idx| &PID_TABLE[idx])
}

/// A decoded live-data or freeze-frame value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterReading {
    pub mode: u8,
    pub pid: u8,
    pub name: String,
    /// Response data bytes exactly as received
    pub raw: Vec<u8>,
    pub value: f64,
    pub unit: String,
}

impl ParameterReading {
    pub(crate) fn from_spec(mode: u8, spec: &PidSpec, raw: &[u8]) -> Self {
        Self {
            mode,
            pid: spec.pid,
            name: spec.name.to_string(),
            raw: raw.to_vec(),
            value: spec.apply(raw),
            unit: spec.unit.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted() {
        assert!(PID_TABLE.windows(2).all(|w| w[0].pid < w[1].pid));
    }

    #[test]
    fn test_lookup() {
        let rpm = lookup(0x0C).unwrap();
        assert_eq!(rpm.width, 2);
        assert_eq!(rpm.unit, "rpm");
        assert!(lookup(0x14).is_none());
    }

    #[test]
    fn test_rpm_formula() {
        let rpm = lookup(0x0C).unwrap();
        assert_eq!(rpm.raw_value(&[0x09, 0xC4]), 2500);
        assert!((rpm.apply(&[0x09, 0xC4]) - 625.0).abs() < f64::EPSILON);
        assert!((rpm.apply(&[0x27, 0x10]) - 2500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_coolant_temp_formula() {
        // 0x73 = 115, so temp = 115 - 40 = 75°C
        let coolant = lookup(0x05).unwrap();
        assert!((coolant.apply(&[0x73]) - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_fuel_trim_formula() {
        let trim = lookup(0x06).unwrap();
        assert!((trim.apply(&[0x80]) - 0.0).abs() < 0.01);
        assert!((trim.apply(&[0x90]) - 12.5).abs() < 0.01);
    }

    #[test]
    fn test_timing_advance_formula() {
        let timing = lookup(0x0E).unwrap();
        assert!((timing.apply(&[0x80]) - 0.0).abs() < 0.01);
    }
}
