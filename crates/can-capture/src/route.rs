//! Frame routing by service byte
//!
//! Single and first frames expose the service identifier directly; the
//! route chosen for a first frame is remembered per address so the
//! consecutive frames that follow land in the same decoder queue.

use crate::isotp::PciType;
use obd_protocol::is_response_sid;
use ring_buffer::Frame;
use std::collections::HashMap;
use tracing::debug;

/// Destination of a raw frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// OBD-II response (0x41..0x4A)
    Obd,
    /// Any other diagnostic-service traffic
    Uds,
    /// OBD-II requests, flow control, and frames with no usable PCI
    Skip,
}

impl Route {
    /// Route for a message whose first byte is `sid`
    pub fn for_service(sid: u8) -> Self {
        match sid {
            s if is_response_sid(s) => Route::Obd,
            // Requests heard on the bus (ours or another tester's)
            0x01..=0x0A => Route::Skip,
            _ => Route::Uds,
        }
    }
}

/// Classifies raw frames, remembering multi-frame routes per address
#[derive(Debug, Default)]
pub struct FrameRouter {
    open: HashMap<u32, Route>,
}

impl FrameRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, frame: &Frame) -> Route {
        let payload = frame.payload();
        match PciType::of(payload) {
            Some(PciType::Single) => match payload.get(1) {
                Some(&sid) if payload[0] & 0x0F != 0 => {
                    self.open.remove(&frame.id());
                    Route::for_service(sid)
                }
                _ => Route::Skip,
            },
            Some(PciType::First) => match payload.get(2) {
                Some(&sid) => {
                    let route = Route::for_service(sid);
                    self.open.insert(frame.id(), route);
                    route
                }
                None => Route::Skip,
            },
            Some(PciType::Consecutive) => match self.open.get(&frame.id()) {
                Some(route) => *route,
                None => {
                    debug!("Consecutive frame from {:03X} with no open route", frame.id());
                    Route::Skip
                }
            },
            Some(PciType::FlowControl) | None => Route::Skip,
        }
    }

    /// True if `frame` opens a multi-frame response that needs flow control
    pub fn is_first_frame(frame: &Frame) -> bool {
        PciType::of(frame.payload()) == Some(PciType::First)
    }
}
