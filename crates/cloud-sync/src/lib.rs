//! Cloud Synchronization Module
//!
//! Drains sealed batches from the offline buffer to an MQTT broker:
//! - acknowledged (QoS 1) delivery, in sequence order
//! - capped exponential backoff while the broker is unreachable
//! - periodic liveness announcements on the status topic

mod message;
mod publisher;
mod transport;

pub use message::{
    FaultEntry, IdentifierEntry, ParameterValue, PublisherCounters, ReadingEntry, StatusMessage,
    TelemetryMessage,
};
pub use publisher::{Publisher, PublisherState, PublisherStats};
pub use transport::{MqttTransport, Transport};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Cloud sync error types
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Acknowledgment timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),
}

/// Broker connection and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// MQTT client id; derived from the gateway id when empty
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    /// Wait for the broker's PUBACK
    pub publish_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// Consecutive failures before a persistent failure is reported
    pub retry_attempts: u32,
    pub liveness_interval_secs: u64,
    /// Records fetched from the offline buffer per drain
    pub batch_limit: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: String::new(),
            keep_alive_secs: 60,
            connect_timeout_ms: 5000,
            publish_timeout_ms: 5000,
            retry_base_ms: 1000,
            retry_cap_ms: 4000,
            retry_attempts: 3,
            liveness_interval_secs: 30,
            batch_limit: 50,
        }
    }
}

impl PublishConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    /// Delay after the `failures`-th consecutive failure: base, 2x, 4x, ... capped
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self.retry_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.retry_cap_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.broker_host.is_empty() {
            return Err("publish.broker_host must not be empty".to_string());
        }
        if self.retry_base_ms == 0 || self.retry_cap_ms < self.retry_base_ms {
            return Err(format!(
                "publish retry delays invalid: base {} ms, cap {} ms",
                self.retry_base_ms, self.retry_cap_ms
            ));
        }
        if self.retry_attempts == 0 {
            return Err("publish.retry_attempts must be at least 1".to_string());
        }
        if self.batch_limit == 0 {
            return Err("publish.batch_limit must be at least 1".to_string());
        }
        if self.liveness_interval_secs == 0 {
            return Err("publish.liveness_interval_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// MQTT topic for telemetry batches
pub fn telemetry_topic(vin: &str) -> String {
    format!("vehicle/{}/telemetry", vin)
}

/// MQTT topic for liveness announcements
pub fn status_topic(vin: &str) -> String {
    format!("vehicle/{}/status", vin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let config = PublishConfig::default();
        let delays: Vec<u64> = (1..=6).map(|n| config.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 4, 4, 4]);
    }

    #[test]
    fn test_backoff_survives_huge_failure_counts() {
        let config = PublishConfig::default();
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(4000));
    }

    #[test]
    fn test_topics() {
        assert_eq!(telemetry_topic("1HGCM82633A004352"), "vehicle/1HGCM82633A004352/telemetry");
        assert_eq!(status_topic("1HGCM82633A004352"), "vehicle/1HGCM82633A004352/status");
    }

    #[test]
    fn test_validate() {
        assert!(PublishConfig::default().validate().is_ok());

        let config = PublishConfig {
            retry_cap_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PublishConfig {
            broker_host: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
