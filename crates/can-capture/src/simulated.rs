//! Simulated diagnostic bus
//!
//! Stands in for a hardware adapter. One ECU answers OBD-II Mode 01/02/03/07/0A
//! requests and a handful of UDS services (VIN read, DTC report, session
//! control, keep-alive). On creation it queues an unsolicited VIN response
//! and DTC report so the pipeline has diagnostic traffic from the start.

use crate::isotp;
use crate::{CaptureError, FrameSink, FrameSource};
use obd_protocol::{mode, pid};
use ring_buffer::Frame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

const FUNCTIONAL_ID: u32 = 0x7DF;
const PHYSICAL_REQUEST_ID: u32 = 0x7E0;

/// A stored fault the simulated ECU reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedFault {
    pub code: u16,
    pub status: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedBusConfig {
    pub vin: String,
    /// Identifier the simulated ECU answers on
    pub response_id: u32,
    /// Channel on generated frames; the capture worker retags with its own
    pub channel: u8,
    pub faults: Vec<SimulatedFault>,
}

impl Default for SimulatedBusConfig {
    fn default() -> Self {
        Self {
            vin: "1HGBH41JXMN109186".to_string(),
            response_id: 0x7E8,
            channel: 0,
            faults: vec![
                SimulatedFault { code: 0x0301, status: 0x09 },
                SimulatedFault { code: 0x0420, status: 0x2F },
            ],
        }
    }
}

struct BusState {
    config: SimulatedBusConfig,
    pending: VecDeque<Frame>,
    origin: Instant,
    connected: bool,
    requests: u64,
}

impl BusState {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn queue(&mut self, id: u32, payload: &[u8]) -> Result<(), CaptureError> {
        let frame = Frame::new(id, false, payload, self.now_us(), self.config.channel)
            .map_err(|e| CaptureError::InvalidFrame(e.to_string()))?;
        self.pending.push_back(frame);
        Ok(())
    }

    /// Segment `message` and queue it from the ECU
    fn respond(&mut self, message: &[u8]) -> Result<(), CaptureError> {
        let frames = isotp::segment(message).map_err(|e| CaptureError::Transmit(e.to_string()))?;
        let id = self.config.response_id;
        for frame in frames {
            self.queue(id, &frame)?;
        }
        Ok(())
    }

    fn handle_request(&mut self, request: &[u8]) -> Result<(), CaptureError> {
        self.requests += 1;
        let Some(response) = self.build_response(request) else {
            debug!("Simulated ECU ignoring request {}", hex::encode_upper(request));
            return Ok(());
        };
        self.respond(&response)
    }

    fn build_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        match *request {
            [mode::CURRENT_DATA, p] => {
                let mut out = vec![0x41, p];
                out.extend(self.parameter_bytes(p)?);
                Some(out)
            }
            [mode::FREEZE_FRAME, p, frame] => {
                let mut out = vec![0x42, p, frame];
                out.extend(self.parameter_bytes(p)?);
                Some(out)
            }
            [m] if mode::is_fault_mode(m) => {
                let mut out = vec![m + 0x40, self.config.faults.len() as u8];
                for fault in &self.config.faults {
                    out.extend_from_slice(&fault.code.to_be_bytes());
                }
                Some(out)
            }
            [0x22, 0xF1, 0x90] => Some(self.vin_response()),
            [0x22, _, _] => Some(vec![0x7F, 0x22, 0x31]),
            [0x19, 0x02, mask] => Some(self.dtc_report(mask)),
            [0x3E, sub] if sub & 0x80 == 0 => Some(vec![0x7E, sub]),
            [0x3E, _] => None,
            [0x10, session] => Some(vec![0x50, session, 0x00, 0x32, 0x01, 0xF4]),
            [sid, ..] if sid >= 0x10 => Some(vec![0x7F, sid, 0x11]),
            _ => None,
        }
    }

    /// Plausible raw bytes for a PID, varying with the request count
    fn parameter_bytes(&self, p: u8) -> Option<Vec<u8>> {
        let spec = pid::lookup(p)?;
        let tick = self.requests;
        let value = match p {
            0x0C => 800.0 + (tick * 45 % 2400) as f64,
            0x0D => (tick % 130) as f64,
            0x05 => 88.0 + (tick % 5) as f64,
            0x42 => 13.8 + (tick % 4) as f64 * 0.1,
            _ => {
                let mid = if spec.width == 1 { 0x80 } else { 0x0800 };
                spec.scale * f64::from(mid + (tick % 8) as u32) + spec.offset
            }
        };
        let max = if spec.width == 1 { 0xFF } else { 0xFFFF };
        let raw = ((value - spec.offset) / spec.scale).round().clamp(0.0, f64::from(max)) as u32;
        let bytes = raw.to_be_bytes();
        Some(bytes[4 - spec.width..].to_vec())
    }

    fn vin_response(&self) -> Vec<u8> {
        let mut out = vec![0x62, 0xF1, 0x90];
        out.extend_from_slice(self.config.vin.as_bytes());
        out
    }

    fn dtc_report(&self, mask: u8) -> Vec<u8> {
        let mut out = vec![0x59, 0x02, 0xFF];
        for fault in self.config.faults.iter().filter(|f| f.status & mask != 0) {
            out.extend_from_slice(&fault.code.to_be_bytes());
            out.push(0x00);
            out.push(fault.status);
        }
        out
    }
}

/// Cloneable handle to one simulated bus; clones share state
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new(config: SimulatedBusConfig) -> Result<Self, CaptureError> {
        info!(
            "Simulated bus started: vin={}, ecu={:03X}, {} stored faults",
            config.vin,
            config.response_id,
            config.faults.len()
        );
        let mut state = BusState {
            config,
            pending: VecDeque::new(),
            origin: Instant::now(),
            connected: true,
            requests: 0,
        };

        let vin = state.vin_response();
        state.respond(&vin)?;
        let report = state.dtc_report(0xFF);
        state.respond(&report)?;

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Simulate the adapter dropping off (or coming back)
    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Queue an arbitrary frame as if it had been received
    pub fn inject(&self, frame: Frame) {
        self.lock().pending.push_back(frame);
    }

    /// Frames waiting to be read
    pub fn pending_frames(&self) -> usize {
        self.lock().pending.len()
    }

    /// Requests answered or ignored so far
    pub fn request_count(&self) -> u64 {
        self.lock().requests
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FrameSource for SimulatedBus {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(CaptureError::Disconnected("simulated link down".into()));
        }
        Ok(state.pending.pop_front())
    }
}

impl FrameSink for SimulatedBus {
    fn transmit(&mut self, id: u32, payload: &[u8]) -> Result<(), CaptureError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(CaptureError::Transmit("bus disconnected".into()));
        }
        if id != FUNCTIONAL_ID && id != PHYSICAL_REQUEST_ID {
            return Ok(());
        }

        match isotp::PciType::of(payload) {
            Some(isotp::PciType::Single) => {
                let len = usize::from(payload[0] & 0x0F);
                match payload.get(1..=len) {
                    Some(request) if len > 0 => state.handle_request(request),
                    _ => Err(CaptureError::Transmit(format!(
                        "malformed single frame {}",
                        hex::encode_upper(payload)
                    ))),
                }
            }
            // Flow control from the tester; the simulated ECU never waits for it
            Some(isotp::PciType::FlowControl) => Ok(()),
            _ => Err(CaptureError::Transmit(format!(
                "unsupported request frame {}",
                hex::encode_upper(payload)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isotp::Reassembler;
    use obd_protocol::{encode_request, ObdResponse, ParameterDecoder};

    fn drain(bus: &mut SimulatedBus) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = bus.read_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn reassemble(frames: &[Frame]) -> Vec<Vec<u8>> {
        let mut reassembler = Reassembler::new();
        frames
            .iter()
            .filter_map(|f| reassembler.push(f).unwrap())
            .map(|m| m.data)
            .collect()
    }

    #[test]
    fn test_announces_vin_and_faults() {
        let mut bus = SimulatedBus::new(SimulatedBusConfig::default()).unwrap();
        let messages = reassemble(&drain(&mut bus));

        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0][..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(&messages[0][3..], b"1HGBH41JXMN109186");
        assert_eq!(&messages[1][..3], &[0x59, 0x02, 0xFF]);
        assert_eq!(messages[1].len(), 3 + 2 * 4);
    }

    #[test]
    fn test_answers_live_data_request() {
        let mut bus = SimulatedBus::new(SimulatedBusConfig::default()).unwrap();
        drain(&mut bus);

        bus.transmit(0x7DF, &encode_request(0x01, 0x0C)).unwrap();
        let frames = drain(&mut bus);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), 0x7E8);

        let messages = reassemble(&frames);
        let decoded = ParameterDecoder::new().decode_response(&messages[0]).unwrap();
        match decoded {
            ObdResponse::Reading(reading) => {
                assert_eq!(reading.pid, 0x0C);
                assert!(reading.value >= 800.0 && reading.value < 3200.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_pid_is_ignored() {
        let mut bus = SimulatedBus::new(SimulatedBusConfig::default()).unwrap();
        drain(&mut bus);
        bus.transmit(0x7DF, &encode_request(0x01, 0xFE)).unwrap();
        assert_eq!(bus.pending_frames(), 0);
        assert_eq!(bus.request_count(), 1);
    }

    #[test]
    fn test_disconnect() {
        let mut bus = SimulatedBus::new(SimulatedBusConfig::default()).unwrap();
        bus.set_connected(false);
        assert!(matches!(bus.read_frame(), Err(CaptureError::Disconnected(_))));
        assert!(bus.transmit(0x7DF, &encode_request(0x01, 0x0C)).is_err());

        bus.set_connected(true);
        assert!(bus.read_frame().unwrap().is_some());
    }

    #[test]
    fn test_keep_alive_and_negative_response() {
        let mut bus = SimulatedBus::new(SimulatedBusConfig::default()).unwrap();
        drain(&mut bus);

        bus.transmit(0x7E0, &[0x02, 0x3E, 0x00]).unwrap();
        bus.transmit(0x7E0, &[0x03, 0x22, 0x12, 0x34]).unwrap();
        let messages = reassemble(&drain(&mut bus));
        assert_eq!(messages, vec![vec![0x7E, 0x00], vec![0x7F, 0x22, 0x31]]);
    }
}
