//! OBD-II Parameter Polling
//!
//! Issues Mode 01 requests for a configured set of PIDs, each on its own
//! interval, and correlates responses back to outstanding requests. A
//! response that arrives after its request deadline is stale: it is logged
//! and discarded, never retried inline.

mod scheduler;

pub use scheduler::{run_poller, Correlation, PidStats, PollScheduler, SchedulerStats};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Shortest allowed poll interval
pub const MIN_INTERVAL_MS: u64 = 100;
/// Longest allowed poll interval
pub const MAX_INTERVAL_MS: u64 = 5000;

/// Scheduler errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("PID {pid:#04X}: interval {interval_ms} ms outside 100..=5000 ms")]
    InvalidInterval { pid: u8, interval_ms: u64 },

    #[error("PID {0:#04X} is not in the parameter table")]
    UnknownPid(u8),

    #[error("PID {0:#04X} is already scheduled")]
    DuplicatePid(u8),

    #[error("PID {0:#04X} is not scheduled")]
    NotScheduled(u8),

    #[error("Request transmit failed: {0}")]
    Transmit(String),
}

/// Where request frames go
pub trait RequestSink {
    fn send_request(&mut self, id: u32, frame: &[u8; 8]) -> Result<(), SchedulerError>;
}

/// One polled parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    pub pid: u8,
    pub interval_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl PollSpec {
    pub fn new(pid: u8, interval_ms: u64) -> Self {
        Self {
            pid,
            interval_ms,
            enabled: true,
        }
    }
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObdConfig {
    pub enabled: bool,
    /// Identifier requests are sent on (functional broadcast by default)
    pub request_id: u32,
    /// Deadline for a response after its request
    pub response_timeout_ms: u64,
    /// Stored-fault (Mode 03) poll interval; 0 disables
    pub fault_interval_ms: u64,
    pub pids: Vec<PollSpec>,
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_id: obd_protocol::FUNCTIONAL_REQUEST_ID,
            response_timeout_ms: 1000,
            fault_interval_ms: 60_000,
            pids: vec![
                PollSpec::new(0x0C, 200),  // RPM
                PollSpec::new(0x0D, 200),  // Speed
                PollSpec::new(0x04, 500),  // Engine load
                PollSpec::new(0x11, 500),  // Throttle
                PollSpec::new(0x05, 1000), // Coolant
                PollSpec::new(0x0F, 2000), // Intake air temp
                PollSpec::new(0x42, 2000), // Module voltage
                PollSpec::new(0x2F, 5000), // Fuel level
            ],
        }
    }
}

impl ObdConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Check every PID against the table and the interval bounds
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let mut seen = Vec::with_capacity(self.pids.len());
        for spec in &self.pids {
            validate_entry(spec.pid, spec.interval_ms)?;
            if seen.contains(&spec.pid) {
                return Err(SchedulerError::DuplicatePid(spec.pid));
            }
            seen.push(spec.pid);
        }
        Ok(())
    }
}

pub(crate) fn validate_entry(pid: u8, interval_ms: u64) -> Result<(), SchedulerError> {
    if obd_protocol::pid::lookup(pid).is_none() {
        return Err(SchedulerError::UnknownPid(pid));
    }
    if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
        return Err(SchedulerError::InvalidInterval { pid, interval_ms });
    }
    Ok(())
}
