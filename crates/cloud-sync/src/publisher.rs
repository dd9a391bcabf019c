//! Publisher state machine

use crate::message::{PublisherCounters, StatusMessage, TelemetryMessage};
use crate::transport::Transport;
use crate::{status_topic, telemetry_topic, PublishConfig, PublishError};
use alerting::{HealthEvent, HealthReporter};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{decode_record, OfflineBuffer};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Connection state of the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl PublisherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublisherState::Disconnected => "disconnected",
            PublisherState::Connecting => "connecting",
            PublisherState::Connected => "connected",
            PublisherState::Backoff => "backoff",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PublisherState::Connecting,
            2 => PublisherState::Connected,
            3 => PublisherState::Backoff,
            _ => PublisherState::Disconnected,
        }
    }
}

/// Counters shared with the stats reporter while the publisher runs
#[derive(Debug, Default)]
pub struct PublisherStats {
    published: AtomicU64,
    failed: AtomicU64,
    reconnects: AtomicU64,
    skipped: AtomicU64,
    liveness_sent: AtomicU64,
    consecutive_failures: AtomicU32,
    state: AtomicU8,
}

impl PublisherStats {
    /// Batches acknowledged by the broker
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Failed connect or publish attempts
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Records dropped because they could not be decoded
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn liveness_sent(&self) -> u64 {
        self.liveness_sent.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> PublisherState {
        PublisherState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: PublisherState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn counters(&self, pending: usize) -> PublisherCounters {
        PublisherCounters {
            published: self.published(),
            failed: self.failed(),
            consecutive_failures: self.consecutive_failures(),
            reconnects: self.reconnects(),
            skipped: self.skipped(),
            pending,
        }
    }
}

/// Drains sealed batches from the offline buffer to the broker.
///
/// Records are marked transmitted only after the broker acknowledges
/// them, so anything in flight when the connection drops is sent again.
pub struct Publisher<T: Transport> {
    config: PublishConfig,
    vin: String,
    gateway_id: String,
    telemetry_topic: String,
    status_topic: String,
    transport: T,
    buffer: Arc<OfflineBuffer>,
    health: Option<HealthReporter>,
    stats: Arc<PublisherStats>,
    state: PublisherState,
    failures: u32,
    failing_reported: bool,
    ever_connected: bool,
    started: Instant,
    next_liveness: Instant,
}

impl<T: Transport> Publisher<T> {
    pub fn new(
        config: PublishConfig,
        vin: impl Into<String>,
        gateway_id: impl Into<String>,
        transport: T,
        buffer: Arc<OfflineBuffer>,
    ) -> Self {
        let vin = vin.into();
        info!(
            "Publisher for {} -> {}:{}",
            vin, config.broker_host, config.broker_port
        );
        let now = Instant::now();
        Self {
            telemetry_topic: telemetry_topic(&vin),
            status_topic: status_topic(&vin),
            config,
            vin,
            gateway_id: gateway_id.into(),
            transport,
            buffer,
            health: None,
            stats: Arc::new(PublisherStats::default()),
            state: PublisherState::Disconnected,
            failures: 0,
            failing_reported: false,
            ever_connected: false,
            started: now,
            next_liveness: now,
        }
    }

    pub fn with_health(mut self, reporter: HealthReporter) -> Self {
        self.health = Some(reporter);
        self
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn set_state(&mut self, state: PublisherState) {
        if self.state != state {
            debug!("Publisher {} -> {}", self.state.as_str(), state.as_str());
        }
        self.state = state;
        self.stats.set_state(state);
    }

    fn report(&self, event: HealthEvent) {
        if let Some(health) = &self.health {
            health.report(event);
        }
    }

    /// Advance the state machine by one transition. Returns how long the
    /// caller should wait before the next step, or `None` to step again
    /// immediately.
    pub async fn step(&mut self) -> Option<Duration> {
        match self.state {
            PublisherState::Disconnected | PublisherState::Backoff => {
                self.set_state(PublisherState::Connecting);
                None
            }
            PublisherState::Connecting => match self.transport.connect().await {
                Ok(()) => {
                    if self.ever_connected {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    self.ever_connected = true;
                    self.next_liveness = Instant::now();
                    self.set_state(PublisherState::Connected);
                    None
                }
                Err(e) => {
                    warn!("Broker connect failed: {}", e);
                    Some(self.fail())
                }
            },
            PublisherState::Connected => self.step_connected().await,
        }
    }

    async fn step_connected(&mut self) -> Option<Duration> {
        if !self.transport.is_connected() {
            warn!("Broker connection lost, reconnecting");
            self.set_state(PublisherState::Connecting);
            return None;
        }

        if Instant::now() >= self.next_liveness {
            if let Err(e) = self.announce().await {
                return Some(self.handle_error(e));
            }
            self.next_liveness = Instant::now() + self.config.liveness_interval();
        }

        match self.drain().await {
            Ok(0) => Some(self.next_liveness.saturating_duration_since(Instant::now())),
            Ok(_) => None,
            Err(e) => Some(self.handle_error(e)),
        }
    }

    /// Publish up to `batch_limit` pending records, oldest first
    async fn drain(&mut self) -> Result<usize, PublishError> {
        let records = self.buffer.pending(self.config.batch_limit).await?;
        let mut processed = 0;

        for record in records {
            let batch = match decode_record(&record) {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Skipping undecodable record {}: {}", record.sequence, e);
                    self.buffer.mark_transmitted(record.sequence).await?;
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    processed += 1;
                    continue;
                }
            };

            let message = TelemetryMessage::from_batch(&batch, &self.vin);
            let payload = serde_json::to_vec(&message)?;
            let size = payload.len();
            self.transport.publish(&self.telemetry_topic, payload).await?;
            self.buffer.mark_transmitted(record.sequence).await?;

            self.stats.published.fetch_add(1, Ordering::Relaxed);
            self.succeeded();
            processed += 1;
            debug!(
                "Published batch {} ({} readings, {} faults, {} bytes)",
                record.sequence,
                message.readings.len(),
                message.faults.len(),
                size
            );
        }
        Ok(processed)
    }

    async fn announce(&mut self) -> Result<(), PublishError> {
        let pending = self.buffer.pending_count().await;
        let message = StatusMessage {
            gateway_id: self.gateway_id.clone(),
            vin: self.vin.clone(),
            status: "online".to_string(),
            state: self.state.as_str().to_string(),
            timestamp: chrono::Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            stats: self.stats.counters(pending),
        };
        let payload = serde_json::to_vec(&message)?;
        self.transport.publish(&self.status_topic, payload).await?;
        self.stats.liveness_sent.fetch_add(1, Ordering::Relaxed);
        self.succeeded();
        debug!("Liveness sent ({} pending)", pending);
        Ok(())
    }

    fn handle_error(&mut self, error: PublishError) -> Duration {
        match error {
            // Local store trouble is not a broker failure; stay connected
            PublishError::Storage(e) => {
                warn!("Offline buffer read failed: {}", e);
                self.config.backoff(1)
            }
            other => {
                warn!("Publish failed: {}", other);
                self.fail()
            }
        }
    }

    fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .consecutive_failures
            .store(self.failures, Ordering::Relaxed);

        if self.failures >= self.config.retry_attempts && !self.failing_reported {
            error!(
                "Broker unreachable after {} consecutive attempts; retrying every {:?}",
                self.failures,
                self.config.backoff(u32::MAX)
            );
            self.report(HealthEvent::PublishFailing {
                consecutive_failures: self.failures,
            });
            self.failing_reported = true;
        }

        let delay = self.config.backoff(self.failures);
        self.set_state(PublisherState::Backoff);
        debug!("Retrying broker in {:?}", delay);
        delay
    }

    fn succeeded(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            self.stats.consecutive_failures.store(0, Ordering::Relaxed);
        }
        if self.failing_reported {
            info!("Broker delivery recovered");
            self.report(HealthEvent::PublishRecovered);
            self.failing_reported = false;
        }
    }

    /// Step until shutdown, waking early when a new batch is sealed
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        info!("Publisher started");
        let buffer = self.buffer.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(wait) = self.step().await else {
                continue;
            };
            let connected = self.state == PublisherState::Connected;

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = buffer.wait_sealed(), if connected => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.transport.disconnect().await;
        self.set_state(PublisherState::Disconnected);
        info!(
            "Publisher stopped: {} published, {} failed attempts",
            self.stats.published(),
            self.stats.failed()
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use message_fabric::{Envelope, Payload, Stage};
    use obd_protocol::ParameterDecoder;
    use storage::{MemoryStore, OfflineConfig, OfflineRecord, RecordStore};

    const VIN: &str = "1HGCM82633A004352";

    async fn buffer_with(store: MemoryStore, batches: usize) -> Arc<OfflineBuffer> {
        let buffer = OfflineBuffer::with_store(OfflineConfig::default(), Box::new(store))
            .await
            .unwrap();
        let decoder = ParameterDecoder::new();
        for i in 0..batches {
            let reading = decoder.decode(0x01, 0x0D, &[i as u8]).unwrap();
            let envelope = Envelope::new(Stage::ObdDecoder, i as u64, Payload::Parameter(reading));
            buffer.admit(envelope).await.unwrap();
            buffer.flush().await.unwrap();
        }
        Arc::new(buffer)
    }

    fn publisher(transport: &MockTransport, buffer: Arc<OfflineBuffer>) -> Publisher<MockTransport> {
        Publisher::new(PublishConfig::default(), VIN, "edge-gw", transport.clone(), buffer)
    }

    fn telemetry_sequences(transport: &MockTransport) -> Vec<u64> {
        transport
            .published_on("/telemetry")
            .iter()
            .map(|p| serde_json::from_slice::<TelemetryMessage>(p).unwrap().sequence)
            .collect()
    }

    async fn step_until_drained(publisher: &mut Publisher<MockTransport>, buffer: &OfflineBuffer) {
        for _ in 0..200 {
            if buffer.pending_count().await == 0 && publisher.state() == PublisherState::Connected {
                return;
            }
            publisher.step().await;
        }
        panic!("pending records never drained");
    }

    #[tokio::test]
    async fn test_outage_backlog_published_in_order() {
        let buffer = buffer_with(MemoryStore::new(), 120).await;
        assert_eq!(buffer.pending_count().await, 120);

        let transport = MockTransport::new(false);
        let (reporter, mut events) = HealthReporter::channel(16);
        let mut publisher = publisher(&transport, buffer.clone()).with_health(reporter);

        let mut delays = Vec::new();
        while delays.len() < 5 {
            if let Some(delay) = publisher.step().await {
                delays.push(delay.as_secs());
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 4, 4]);
        assert_eq!(publisher.state(), PublisherState::Backoff);
        assert_eq!(
            events.try_recv().unwrap(),
            HealthEvent::PublishFailing { consecutive_failures: 3 }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(buffer.pending_count().await, 120);

        transport.with(|s| s.reachable = true);
        step_until_drained(&mut publisher, &buffer).await;

        assert_eq!(telemetry_sequences(&transport), (1..=120).collect::<Vec<u64>>());
        assert_eq!(events.try_recv().unwrap(), HealthEvent::PublishRecovered);

        let stats = publisher.stats();
        assert_eq!(stats.published(), 120);
        assert_eq!(stats.failed(), 5);
        assert_eq!(stats.consecutive_failures(), 0);
        assert_eq!(stats.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_resends_unacknowledged() {
        let buffer = buffer_with(MemoryStore::new(), 5).await;
        let transport = MockTransport::new(true);
        // status, batch 1, batch 2 go through; batch 3 fails
        transport.with(|s| s.fail_at = Some(3));
        let mut publisher = publisher(&transport, buffer.clone());

        step_until_drained(&mut publisher, &buffer).await;

        assert_eq!(telemetry_sequences(&transport), vec![1, 2, 3, 4, 5]);
        assert_eq!(publisher.stats().reconnects(), 1);
        assert_eq!(publisher.stats().failed(), 1);
    }

    #[tokio::test]
    async fn test_detected_disconnect_reconnects_immediately() {
        let buffer = buffer_with(MemoryStore::new(), 0).await;
        let transport = MockTransport::new(true);
        let mut publisher = publisher(&transport, buffer);

        while publisher.state() != PublisherState::Connected {
            publisher.step().await;
        }
        transport.with(|s| s.connected = false);

        assert_eq!(publisher.step().await, None);
        assert_eq!(publisher.state(), PublisherState::Connecting);
        assert_eq!(publisher.step().await, None);
        assert_eq!(publisher.state(), PublisherState::Connected);
        assert_eq!(transport.with(|s| s.connect_attempts), 2);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_skipped() {
        let store = MemoryStore::new();
        store
            .insert(&OfflineRecord {
                sequence: 1,
                created_at_ms: 0,
                transmitted: false,
                data: vec![0xDE, 0xAD],
            })
            .await
            .unwrap();
        let buffer = buffer_with(store, 1).await;
        assert_eq!(buffer.pending_count().await, 2);

        let transport = MockTransport::new(true);
        let mut publisher = publisher(&transport, buffer.clone());
        step_until_drained(&mut publisher, &buffer).await;

        assert_eq!(telemetry_sequences(&transport), vec![2]);
        assert_eq!(publisher.stats().skipped(), 1);
        assert_eq!(publisher.stats().published(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_every_interval() {
        let buffer = buffer_with(MemoryStore::new(), 0).await;
        let transport = MockTransport::new(true);
        let mut publisher = publisher(&transport, buffer);

        let mut wait = None;
        while wait.is_none() {
            wait = publisher.step().await;
        }
        assert_eq!(wait, Some(Duration::from_secs(30)));

        let statuses = transport.published_on("/status");
        assert_eq!(statuses.len(), 1);
        let status: StatusMessage = serde_json::from_slice(&statuses[0]).unwrap();
        assert_eq!(status.status, "online");
        assert_eq!(status.state, "connected");
        assert_eq!(status.gateway_id, "edge-gw");
        assert_eq!(status.vin, VIN);
        assert_eq!(status.stats.pending, 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        publisher.step().await;
        assert_eq!(transport.published_on("/status").len(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        publisher.step().await;
        assert_eq!(transport.published_on("/status").len(), 2);
        assert_eq!(publisher.stats().liveness_sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_and_stops_on_shutdown() {
        let buffer = buffer_with(MemoryStore::new(), 3).await;
        let transport = MockTransport::new(true);
        let publisher = publisher(&transport, buffer.clone());
        let stats = publisher.stats();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(publisher.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(stats.published(), 3);
        assert_eq!(stats.state(), PublisherState::Connected);

        tx.send(true).unwrap();
        let publisher = task.await.unwrap();
        assert_eq!(publisher.state(), PublisherState::Disconnected);
        assert!(!publisher.transport().is_connected());
        assert_eq!(buffer.pending_count().await, 0);
    }
}
