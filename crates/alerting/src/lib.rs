//! Alerting System
//!
//! Watches the pipeline from the side:
//! - Utilization sampling of the ingestion buffer and every fabric queue
//! - Decode error-rate tracking per decoder
//! - Health events with per-key cooldown deduplication

mod error_rate;
mod health;
mod monitor;

pub use error_rate::ErrorRateTracker;
pub use health::{HealthAggregator, HealthEvent, HealthLevel, HealthReporter};
pub use monitor::{BufferMonitor, BufferSample, Crossing, Observable, UtilizationTracker};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Monitor and alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling interval (default: 5 s)
    pub interval_ms: u64,
    /// Utilization that triggers a warning (default: 0.80)
    pub warning_threshold: f64,
    /// Samples kept for the rolling average
    pub history: usize,
    /// Decode failure fraction that raises a health alert (default: 5%)
    pub error_rate_threshold: f64,
    /// Decode attempts the error rate is computed over
    pub error_rate_window: usize,
    /// Minimum gap between repeated health alerts with the same key
    pub cooldown_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            warning_threshold: 0.80,
            history: 60,
            error_rate_threshold: 0.05,
            error_rate_window: 200,
            cooldown_secs: 60,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}
