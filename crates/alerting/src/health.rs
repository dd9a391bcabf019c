//! Health events
//!
//! Components report through a cloneable [`HealthReporter`]; a single
//! [`HealthAggregator`] logs them, suppressing repeats of the same condition
//! inside the cooldown window. Data-loss events are never suppressed.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Info,
    Warning,
    Critical,
}

/// Conditions worth surfacing to an operator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    CaptureDegraded { reason: String },
    CaptureRecovered,
    BufferPressure { buffer: String, utilization: f64 },
    FramesDropped { buffer: String, count: u64 },
    DecodeErrorRate { decoder: String, rate: f64 },
    PersistenceDegraded { reason: String },
    PersistenceRecovered,
    /// An untransmitted record was evicted
    DataLoss { sequence: u64, bytes: u64 },
    PublishFailing { consecutive_failures: u32 },
    PublishRecovered,
}

impl HealthEvent {
    pub fn level(&self) -> HealthLevel {
        match self {
            HealthEvent::CaptureRecovered
            | HealthEvent::PersistenceRecovered
            | HealthEvent::PublishRecovered => HealthLevel::Info,
            HealthEvent::PersistenceDegraded { .. } | HealthEvent::DataLoss { .. } => HealthLevel::Critical,
            _ => HealthLevel::Warning,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HealthEvent::CaptureDegraded { .. } => "capture_degraded",
            HealthEvent::CaptureRecovered => "capture_recovered",
            HealthEvent::BufferPressure { .. } => "buffer_pressure",
            HealthEvent::FramesDropped { .. } => "frames_dropped",
            HealthEvent::DecodeErrorRate { .. } => "decode_error_rate",
            HealthEvent::PersistenceDegraded { .. } => "persistence_degraded",
            HealthEvent::PersistenceRecovered => "persistence_recovered",
            HealthEvent::DataLoss { .. } => "data_loss",
            HealthEvent::PublishFailing { .. } => "publish_failing",
            HealthEvent::PublishRecovered => "publish_recovered",
        }
    }

    /// Deduplication key: the condition, not the measurement
    pub fn key(&self) -> String {
        match self {
            HealthEvent::CaptureDegraded { .. } | HealthEvent::CaptureRecovered => "capture".into(),
            HealthEvent::BufferPressure { buffer, .. } => format!("pressure:{}", buffer),
            HealthEvent::FramesDropped { buffer, .. } => format!("dropped:{}", buffer),
            HealthEvent::DecodeErrorRate { decoder, .. } => format!("decode:{}", decoder),
            HealthEvent::PersistenceDegraded { .. } | HealthEvent::PersistenceRecovered => "persistence".into(),
            HealthEvent::DataLoss { sequence, .. } => format!("loss:{}", sequence),
            HealthEvent::PublishFailing { .. } | HealthEvent::PublishRecovered => "publish".into(),
        }
    }

    fn is_recovery(&self) -> bool {
        self.level() == HealthLevel::Info
    }
}

/// Sending half handed to every component
#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: mpsc::Sender<HealthEvent>,
    overflow: Arc<AtomicU64>,
}

impl HealthReporter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<HealthEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                overflow: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Never blocks; events that do not fit are counted and logged here
    pub fn report(&self, event: HealthEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            let event = match e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            match event.level() {
                HealthLevel::Critical => error!("Health event not delivered: {:?}", event),
                _ => debug!("Health event not delivered: {:?}", event),
            }
        }
    }

    /// Events that could not be queued
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
struct ConditionState {
    last_fired: Instant,
    fire_count: u64,
}

/// Logs health events with per-condition cooldown
pub struct HealthAggregator {
    cooldown: Duration,
    states: HashMap<String, ConditionState>,
    fired: u64,
    suppressed: u64,
    data_loss_events: u64,
    data_loss_bytes: u64,
}

impl HealthAggregator {
    pub fn new(cooldown: Duration) -> Self {
        info!("Creating health aggregator (cooldown {:?})", cooldown);
        Self {
            cooldown,
            states: HashMap::new(),
            fired: 0,
            suppressed: 0,
            data_loss_events: 0,
            data_loss_bytes: 0,
        }
    }

    fn should_fire(&self, event: &HealthEvent) -> bool {
        if matches!(event, HealthEvent::DataLoss { .. }) || event.is_recovery() {
            return true;
        }
        match self.states.get(&event.key()) {
            Some(state) => state.last_fired.elapsed() >= self.cooldown,
            None => true,
        }
    }

    /// Handle one event; returns true if it was logged
    pub fn handle(&mut self, event: &HealthEvent) -> bool {
        if let HealthEvent::DataLoss { bytes, .. } = event {
            self.data_loss_events += 1;
            self.data_loss_bytes += bytes;
        }

        if !self.should_fire(event) {
            self.suppressed += 1;
            debug!("Health event suppressed (cooldown): {}", event.key());
            return false;
        }

        if event.is_recovery() {
            // Next degradation of this condition alerts immediately
            self.states.remove(&event.key());
        } else if !matches!(event, HealthEvent::DataLoss { .. }) {
            let state = self.states.entry(event.key()).or_insert(ConditionState {
                last_fired: Instant::now(),
                fire_count: 0,
            });
            state.last_fired = Instant::now();
            state.fire_count += 1;
        }
        self.fired += 1;

        match event.level() {
            HealthLevel::Info => info!("Health: {:?}", event),
            HealthLevel::Warning => warn!("Health alert: {:?}", event),
            HealthLevel::Critical => error!("Health alert: {:?}", event),
        }
        true
    }

    /// Times a condition has fired
    pub fn fire_count(&self, key: &str) -> u64 {
        self.states.get(key).map(|s| s.fire_count).unwrap_or(0)
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// (events, bytes) lost to eviction
    pub fn data_loss(&self) -> (u64, u64) {
        (self.data_loss_events, self.data_loss_bytes)
    }

    /// Conditions currently considered active
    pub fn active(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.states.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Consume events until the channel closes or shutdown is signalled.
    /// `on_fired` runs for every event that was not suppressed.
    pub async fn run<F>(
        mut self,
        mut events: mpsc::Receiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
        mut on_fired: F,
    ) -> Self
    where
        F: FnMut(&HealthEvent),
    {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if self.handle(&event) {
                            on_fired(&event);
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        // Anything already queued still gets logged
        while let Ok(event) = events.try_recv() {
            if self.handle(&event) {
                on_fired(&event);
            }
        }
        info!(
            "Health aggregator stopped: {} fired, {} suppressed",
            self.fired, self.suppressed
        );
        self
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressure(u: f64) -> HealthEvent {
        HealthEvent::BufferPressure {
            buffer: "ingestion".into(),
            utilization: u,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_repeats() {
        let mut aggregator = HealthAggregator::new(Duration::from_secs(60));
        assert!(aggregator.handle(&pressure(0.85)));
        assert!(!aggregator.handle(&pressure(0.9)));
        assert_eq!(aggregator.suppressed(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(aggregator.handle(&pressure(0.9)));
        assert_eq!(aggregator.fire_count("pressure:ingestion"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_rearms_condition() {
        let mut aggregator = HealthAggregator::default();
        let degraded = HealthEvent::CaptureDegraded { reason: "bus off".into() };

        assert!(aggregator.handle(&degraded));
        assert_eq!(aggregator.active(), vec!["capture"]);
        assert!(aggregator.handle(&HealthEvent::CaptureRecovered));
        assert!(aggregator.active().is_empty());
        assert!(aggregator.handle(&degraded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_loss_is_never_suppressed() {
        let mut aggregator = HealthAggregator::default();
        for sequence in 0..3 {
            assert!(aggregator.handle(&HealthEvent::DataLoss { sequence: 7, bytes: 100 + sequence }));
        }
        assert_eq!(aggregator.data_loss(), (3, 303));
        assert!(aggregator.active().is_empty());
    }

    #[test]
    fn test_levels() {
        assert_eq!(HealthEvent::DataLoss { sequence: 1, bytes: 1 }.level(), HealthLevel::Critical);
        assert_eq!(HealthEvent::PublishFailing { consecutive_failures: 3 }.level(), HealthLevel::Warning);
        assert_eq!(HealthEvent::PublishRecovered.level(), HealthLevel::Info);
        assert!(HealthLevel::Critical > HealthLevel::Warning);
    }

    #[tokio::test]
    async fn test_reporter_counts_overflow() {
        let (reporter, mut rx) = HealthReporter::channel(1);
        reporter.report(pressure(0.8));
        reporter.report(pressure(0.9));
        assert_eq!(reporter.overflow_count(), 1);
        assert_eq!(rx.recv().await, Some(pressure(0.8)));
    }

    #[tokio::test]
    async fn test_run_drains_and_calls_back() {
        let (reporter, rx) = HealthReporter::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        reporter.report(HealthEvent::PublishFailing { consecutive_failures: 3 });
        reporter.report(HealthEvent::PublishFailing { consecutive_failures: 4 });
        reporter.report(HealthEvent::PublishRecovered);
        drop(reporter);

        let mut kinds = Vec::new();
        let aggregator = HealthAggregator::default()
            .run(rx, shutdown_rx, |e| kinds.push(e.kind()))
            .await;

        assert_eq!(kinds, vec!["publish_failing", "publish_recovered"]);
        assert_eq!(aggregator.suppressed(), 1);
    }
}
