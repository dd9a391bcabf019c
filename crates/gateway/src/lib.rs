//! Edge Telemetry Gateway
//!
//! Wires the capture thread, router, protocol decoders, offline buffer
//! and broker publisher into one running pipeline.

pub mod config;
pub mod pipeline;
pub mod stats;

pub use config::{ConfigError, GatewayConfig};
pub use stats::{PipelineSnapshot, StatsSources};

use alerting::{BufferMonitor, ErrorRateTracker, HealthAggregator, HealthEvent, HealthReporter, Observable};
use anyhow::Context;
use can_capture::{CaptureHandle, CaptureWorker, FrameSink, FrameSource, LinkState, SimulatedBus};
use cloud_sync::{MqttTransport, Publisher, Transport};
use config::LoggingConfig;
use message_fabric::{names, Envelope, MessageFabric};
use obd_scheduler::{run_poller, PollScheduler};
use pipeline::{BusRequests, FrameRouterStage, ObdDecodeStage, ReceiptClock, UdsDecodeStage};
use ring_buffer::RingBuffer;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::OfflineBuffer;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Install the Prometheus exporter on `listen`
pub fn init_metrics(listen: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid metrics address '{}'", listen))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

fn count_health(event: &HealthEvent) {
    metrics::counter!("gateway_health_events_total", "kind" => event.kind()).increment(1);
}

/// Turn capture link changes into health events
async fn watch_link(mut link: watch::Receiver<LinkState>, health: HealthReporter, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = link.borrow_and_update().clone();
                health.report(match state {
                    LinkState::Up => HealthEvent::CaptureRecovered,
                    LinkState::Degraded(reason) => HealthEvent::CaptureDegraded { reason },
                });
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Tasks sharing one shutdown signal
struct TaskGroup {
    name: &'static str,
    signal: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    fn new(name: &'static str) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            name,
            signal,
            tasks: Vec::new(),
        }
    }

    fn spawn<F>(&mut self, task: impl FnOnce(watch::Receiver<bool>) -> F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task(self.signal.subscribe())));
    }

    async fn stop(self) {
        let _ = self.signal.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("{} task failed: {}", self.name, e);
            }
        }
    }
}

/// A running gateway
pub struct Gateway {
    capture: CaptureHandle,
    router: TaskGroup,
    decoders: TaskGroup,
    offline_stage: TaskGroup,
    services: TaskGroup,
    health: Option<JoinHandle<HealthAggregator>>,
    sources: StatsSources,
}

impl Gateway {
    /// Start on the built-in simulated bus, the SQLite offline store and
    /// the MQTT broker named in `config`
    pub async fn start(config: GatewayConfig) -> anyhow::Result<Self> {
        if !config.capture.simulated {
            anyhow::bail!("no hardware CAN adapter is built in; set capture.simulated = true");
        }
        let bus = SimulatedBus::new(config.simulator.clone())?;

        let offline = OfflineBuffer::open(config.offline.clone())
            .await
            .with_context(|| format!("failed to open offline buffer at {}", config.offline.db_path))?;
        let transport = MqttTransport::new(&config.publish, &config.vehicle.gateway_id);

        Self::start_with(config, bus.clone(), bus, offline, transport).await
    }

    /// Start on caller-supplied bus, offline buffer and broker transport
    pub async fn start_with<S, K, T>(
        config: GatewayConfig,
        source: S,
        sink: K,
        offline: OfflineBuffer,
        transport: T,
    ) -> anyhow::Result<Self>
    where
        S: FrameSource + Send + 'static,
        K: FrameSink + Clone + Send + 'static,
        T: Transport + 'static,
    {
        config.validate()?;
        info!(
            "Starting gateway {} for VIN {}",
            config.vehicle.gateway_id, config.vehicle.vin
        );

        let (reporter, health_rx) = HealthReporter::channel(256);
        let ring = Arc::new(RingBuffer::from_config(&config.ingestion));
        let fabric = Arc::new(MessageFabric::new());
        config.queues.build(&fabric)?;
        let uds_frames = fabric.queue(names::UDS_FRAMES)?;
        let obd_frames = fabric.queue(names::OBD_FRAMES)?;
        let decoded = fabric.queue(names::DECODED)?;
        let offline = Arc::new(offline.with_health(reporter.clone()));
        let scheduler = Arc::new(Mutex::new(PollScheduler::new(&config.obd)?));
        let enqueue_timeout = config.queues.enqueue_timeout();
        let dequeue_timeout = config.queues.dequeue_timeout();

        let mut services = TaskGroup::new("service");
        let mut router = TaskGroup::new("router");
        let mut decoders = TaskGroup::new("decoder");
        let mut offline_stage = TaskGroup::new("offline");

        // Health aggregation outlives every other task
        let health = tokio::spawn(HealthAggregator::new(config.monitor.cooldown()).run(
            health_rx,
            services.signal.subscribe(),
            count_health,
        ));

        let capture = CaptureWorker::spawn(source, ring.clone(), &config.capture)?;
        let link = capture.link_state();
        let link_reporter = reporter.clone();
        services.spawn(move |rx| watch_link(link, link_reporter, rx));

        let clock = ReceiptClock::new();
        let flow_control = config.capture.send_flow_control.then(|| sink.clone());
        let frame_router = FrameRouterStage::new(
            ring.clone(),
            uds_frames.clone(),
            obd_frames.clone(),
            flow_control,
            config.router.clone(),
            enqueue_timeout,
            clock,
        );
        router.spawn(move |rx| frame_router.run(rx));

        let uds = UdsDecodeStage::new(
            uds_frames.clone(),
            decoded.clone(),
            ErrorRateTracker::new("uds", config.monitor.error_rate_threshold, config.monitor.error_rate_window),
            reporter.clone(),
            enqueue_timeout,
            dequeue_timeout,
        );
        decoders.spawn(move |rx| uds.run(rx));

        let obd = ObdDecodeStage::new(
            obd_frames.clone(),
            decoded.clone(),
            scheduler.clone(),
            clock,
            ErrorRateTracker::new("obd", config.monitor.error_rate_threshold, config.monitor.error_rate_window),
            reporter.clone(),
            enqueue_timeout,
            dequeue_timeout,
        );
        decoders.spawn(move |rx| obd.run(rx));

        let offline_input = decoded.clone();
        let offline_buffer = offline.clone();
        offline_stage.spawn(move |rx| pipeline::run_offline_stage(offline_input, offline_buffer, dequeue_timeout, rx));

        if config.obd.enabled {
            let poller = scheduler.clone();
            let requests = BusRequests::new(sink);
            services.spawn(move |rx| run_poller(poller, requests, rx));
        } else {
            info!("OBD-II polling disabled");
        }

        let mut monitor = BufferMonitor::new(config.monitor.clone()).with_reporter(reporter.clone());
        monitor.watch(ring.clone() as Arc<dyn Observable>);
        for queue in fabric.queues() {
            monitor.watch(queue as Arc<dyn Observable>);
        }
        services.spawn(move |rx| monitor.run(rx));

        let publisher = Publisher::new(
            config.publish.clone(),
            config.vehicle.vin.clone(),
            config.vehicle.gateway_id.clone(),
            transport,
            offline.clone(),
        )
        .with_health(reporter);
        let publisher_stats = publisher.stats();
        services.spawn(move |rx| async move {
            publisher.run(rx).await;
        });

        let sources = StatsSources {
            ring,
            fabric,
            scheduler,
            offline,
            publisher: publisher_stats,
        };
        let reporter_sources = sources.clone();
        let interval = Duration::from_secs(config.metrics.stats_interval_secs.max(1));
        services.spawn(move |rx| stats::run_stats_reporter(reporter_sources, interval, rx));

        info!("Gateway running");
        Ok(Self {
            capture,
            router,
            decoders,
            offline_stage,
            services,
            health: Some(health),
            sources,
        })
    }

    pub async fn snapshot(&self) -> PipelineSnapshot {
        self.sources.snapshot().await
    }

    /// Frames read by the capture thread and adapter read errors
    pub fn capture_counters(&self) -> (u64, u64) {
        (self.capture.frames_read(), self.capture.read_errors())
    }

    /// Stop front to back so every captured frame reaches the offline
    /// buffer and the open batch is sealed before exit
    pub async fn shutdown(mut self) -> PipelineSnapshot {
        info!("Shutting down gateway");
        self.capture.stop();
        self.router.stop().await;
        self.decoders.stop().await;
        self.offline_stage.stop().await;
        self.services.stop().await;

        if let Some(health) = self.health.take() {
            match health.await {
                Ok(aggregator) => {
                    let (events, bytes) = aggregator.data_loss();
                    info!(
                        "Health: {} alerts fired, {} suppressed, {} data-loss events ({} bytes)",
                        aggregator.fired(),
                        aggregator.suppressed(),
                        events,
                        bytes
                    );
                }
                Err(e) => error!("Health aggregator failed: {}", e),
            }
        }

        let snapshot = self.sources.snapshot().await;
        info!("Final: {}", snapshot.summary());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use can_capture::SimulatedBusConfig;
    use cloud_sync::{PublishError, TelemetryMessage};
    use storage::{MemoryStore, OfflineConfig};

    /// Broker stand-in that accepts everything
    #[derive(Clone, Default)]
    struct RecordingTransport {
        connected: bool,
        published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&mut self) -> Result<(), PublishError> {
            self.connected = true;
            Ok(())
        }

        async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.vehicle.vin = "1HGBH41JXMN109186".to_string();
        config.capture.idle_ms = 1;
        config.offline.batch_window_ms = 200;
        config.monitor.interval_ms = 100;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simulated_bus_end_to_end() {
        let config = test_config();
        let bus = SimulatedBus::new(SimulatedBusConfig::default()).unwrap();
        let offline = OfflineBuffer::with_store(config.offline.clone(), Box::new(MemoryStore::new()))
            .await
            .unwrap();
        let transport = RecordingTransport::default();
        let published = transport.published.clone();

        let gateway = Gateway::start_with(config, bus.clone(), bus.clone(), offline, transport)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let snapshot = gateway.shutdown().await;

        assert!(bus.request_count() > 0);
        assert!(snapshot.offline.batches_sealed >= 1);
        assert_eq!(snapshot.ingestion.dropped, 0);

        let messages: Vec<TelemetryMessage> = published
            .lock()
            .unwrap()
            .iter()
            .filter(|(topic, _)| topic == "vehicle/1HGBH41JXMN109186/telemetry")
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect();
        assert!(!messages.is_empty());

        let sequences: Vec<u64> = messages.iter().map(|m| m.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted);

        // Start-up announcements from the simulated ECU
        let identifiers: Vec<_> = messages.iter().flat_map(|m| m.identifiers.iter()).collect();
        assert!(identifiers
            .iter()
            .any(|i| i.text.as_deref() == Some("1HGBH41JXMN109186")));
        let faults: Vec<&str> = messages
            .iter()
            .flat_map(|m| m.faults.iter())
            .filter(|f| f.source == "uds")
            .map(|f| f.code.as_str())
            .collect();
        assert!(faults.contains(&"P0301"));

        // Polled parameters
        assert!(messages.iter().any(|m| m.data.contains_key("engine_rpm")));
    }

    #[tokio::test]
    async fn test_hardware_capture_not_available() {
        let mut config = test_config();
        config.capture.simulated = false;
        let err = Gateway::start(config).await.err().unwrap();
        assert!(err.to_string().contains("capture.simulated"));
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let mut config = test_config();
        config.router.drain_batch = 0;
        let bus = SimulatedBus::new(SimulatedBusConfig::default()).unwrap();
        let offline = OfflineBuffer::with_store(OfflineConfig::default(), Box::new(MemoryStore::new()))
            .await
            .unwrap();
        let result = Gateway::start_with(config, bus.clone(), bus, offline, RecordingTransport::default()).await;
        assert!(result.is_err());
    }
}
