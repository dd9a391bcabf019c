//! Gateway configuration
//!
//! One struct per component, each owned by its crate, loaded from an
//! optional TOML/YAML/JSON file with `GATEWAY__SECTION__KEY` environment
//! overrides on top.

use alerting::MonitorConfig;
use can_capture::{CaptureConfig, SimulatedBusConfig};
use cloud_sync::PublishConfig;
use message_fabric::FabricConfig;
use obd_scheduler::ObdConfig;
use ring_buffer::RingBufferConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use storage::OfflineConfig;
use thiserror::Error;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "GATEWAY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub vin: String,
    pub gateway_id: String,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            vin: "UNKNOWNVIN0000000".to_string(),
            gateway_id: "edge-gw".to_string(),
        }
    }
}

/// Ingestion buffer to decoder queue hand-off
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Frames taken from the ingestion buffer per pass
    pub drain_batch: usize,
    /// Sleep when the ingestion buffer is empty
    pub idle_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            drain_batch: 256,
            idle_ms: 5,
        }
    }
}

impl RouterConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape address, e.g. "0.0.0.0:9100"; disabled when unset
    pub listen: Option<String>,
    /// Period of the pipeline statistics line
    pub stats_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: None,
            stats_interval_secs: 30,
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub vehicle: VehicleConfig,
    pub ingestion: RingBufferConfig,
    pub router: RouterConfig,
    pub queues: FabricConfig,
    pub monitor: MonitorConfig,
    pub offline: OfflineConfig,
    pub publish: PublishConfig,
    pub obd: ObdConfig,
    pub capture: CaptureConfig,
    pub simulator: SimulatedBusConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl GatewayConfig {
    /// Load defaults, then `path` (if given), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: GatewayConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vehicle.vin.trim().is_empty() {
            return Err(invalid("vehicle.vin must not be empty"));
        }
        if self.ingestion.capacity == 0 {
            return Err(invalid("ingestion.capacity must be at least 1"));
        }
        if self.router.drain_batch == 0 {
            return Err(invalid("router.drain_batch must be at least 1"));
        }
        for (name, capacity) in [
            ("uds_frames", self.queues.uds_frames),
            ("obd_frames", self.queues.obd_frames),
            ("decoded", self.queues.decoded),
        ] {
            if capacity == 0 {
                return Err(invalid(format!("queues.{} must be at least 1", name)));
            }
        }
        for (name, value) in [
            ("monitor.warning_threshold", self.monitor.warning_threshold),
            ("monitor.error_rate_threshold", self.monitor.error_rate_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(format!("{} must be in (0, 1], got {}", name, value)));
            }
        }
        if self.monitor.interval_ms == 0 {
            return Err(invalid("monitor.interval_ms must be at least 1"));
        }

        self.offline.validate().map_err(|e| invalid(e.to_string()))?;
        self.publish.validate().map_err(invalid)?;
        self.obd.validate().map_err(|e| invalid(e.to_string()))?;

        if let Some(listen) = &self.metrics.listen {
            listen
                .parse::<std::net::SocketAddr>()
                .map_err(|e| invalid(format!("metrics.listen '{}': {}", listen, e)))?;
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
