//! Pipeline statistics and metrics

use cloud_sync::{PublisherState, PublisherStats};
use message_fabric::{Envelope, MessageFabric, QueueStats};
use obd_scheduler::{PollScheduler, SchedulerStats};
use ring_buffer::RingBuffer;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::{OfflineBuffer, OfflineStats};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct IngestionStats {
    pub occupancy: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub frames_per_sec: f64,
    pub accepted: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublisherSnapshot {
    pub state: PublisherState,
    pub published: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub reconnects: u64,
    pub skipped: u64,
    pub liveness_sent: u64,
}

/// Point-in-time view of every stage
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub ingestion: IngestionStats,
    pub queues: Vec<QueueStats>,
    pub poller: SchedulerStats,
    pub offline: OfflineStats,
    pub publisher: PublisherSnapshot,
}

impl PipelineSnapshot {
    fn queue_depth(&self, name: &str) -> usize {
        self.queues
            .iter()
            .find(|q| q.name == name)
            .map_or(0, |q| q.depth)
    }

    /// One-line summary for the periodic log
    pub fn summary(&self) -> String {
        format!(
            "ingestion {}/{} ({:.0} fps, {} dropped) | queues uds {} obd {} decoded {} | \
             poller {} sent, {} stale | offline {} pending ({} bytes, {:.1}%) | broker {} ({} published, {} failed)",
            self.ingestion.occupancy,
            self.ingestion.capacity,
            self.ingestion.frames_per_sec,
            self.ingestion.dropped,
            self.queue_depth(message_fabric::names::UDS_FRAMES),
            self.queue_depth(message_fabric::names::OBD_FRAMES),
            self.queue_depth(message_fabric::names::DECODED),
            self.poller.requests_sent,
            self.poller.stale,
            self.offline.pending_records,
            self.offline.pending_bytes,
            self.offline.utilization * 100.0,
            self.publisher.state.as_str(),
            self.publisher.published,
            self.publisher.failed,
        )
    }

    /// Publish the snapshot as gauges
    pub fn record_metrics(&self) {
        metrics::gauge!("gateway_ingestion_occupancy").set(self.ingestion.occupancy as f64);
        metrics::gauge!("gateway_ingestion_frames_per_sec").set(self.ingestion.frames_per_sec);
        metrics::gauge!("gateway_ingestion_dropped").set(self.ingestion.dropped as f64);

        for queue in &self.queues {
            metrics::gauge!("gateway_queue_depth", "queue" => queue.name.clone()).set(queue.depth as f64);
            metrics::gauge!("gateway_queue_dropped", "queue" => queue.name.clone()).set(queue.dropped as f64);
        }

        metrics::gauge!("gateway_poller_requests").set(self.poller.requests_sent as f64);
        metrics::gauge!("gateway_poller_stale").set(self.poller.stale as f64);

        metrics::gauge!("gateway_offline_pending_records").set(self.offline.pending_records as f64);
        metrics::gauge!("gateway_offline_bytes").set(self.offline.total_bytes as f64);
        metrics::gauge!("gateway_offline_data_loss_bytes").set(self.offline.data_loss_bytes as f64);

        metrics::gauge!("gateway_publish_published").set(self.publisher.published as f64);
        metrics::gauge!("gateway_publish_failed").set(self.publisher.failed as f64);
        metrics::gauge!("gateway_publish_connected")
            .set(if self.publisher.state == PublisherState::Connected { 1.0 } else { 0.0 });
    }
}

/// Handles the reporter reads from
#[derive(Clone)]
pub struct StatsSources {
    pub ring: Arc<RingBuffer>,
    pub fabric: Arc<MessageFabric<Envelope>>,
    pub scheduler: Arc<Mutex<PollScheduler>>,
    pub offline: Arc<OfflineBuffer>,
    pub publisher: Arc<PublisherStats>,
}

impl StatsSources {
    pub async fn snapshot(&self) -> PipelineSnapshot {
        let ring = &self.ring;
        let poller = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats();
        let publisher = &self.publisher;

        PipelineSnapshot {
            ingestion: IngestionStats {
                occupancy: ring.occupancy(),
                capacity: ring.capacity(),
                utilization: ring.utilization(),
                frames_per_sec: ring.rate(),
                accepted: ring.total_accepted(),
                dropped: ring.dropped_count(),
            },
            queues: self.fabric.stats(),
            poller,
            offline: self.offline.stats().await,
            publisher: PublisherSnapshot {
                state: publisher.state(),
                published: publisher.published(),
                failed: publisher.failed(),
                consecutive_failures: publisher.consecutive_failures(),
                reconnects: publisher.reconnects(),
                skipped: publisher.skipped(),
                liveness_sent: publisher.liveness_sent(),
            },
        }
    }
}

/// Log and export a snapshot every `interval` until shutdown
pub async fn run_stats_reporter(sources: StatsSources, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = sources.snapshot().await;
                info!("Pipeline: {}", snapshot.summary());
                snapshot.record_metrics();
            }
            _ = shutdown.changed() => break,
        }
    }
}
