//! Pipeline workers
//!
//! Each stage is one task. Stages only talk through the fabric queues,
//! except the OBD decoder, which correlates responses against the shared
//! poll scheduler.

use crate::config::RouterConfig;
use alerting::{ErrorRateTracker, HealthEvent, HealthReporter};
use can_capture::{isotp, FrameRouter, FrameSink, IsoTpMessage, Reassembler, Route};
use message_fabric::{BoundedQueue, Envelope, Payload, SendMode, Stage};
use obd_protocol::{mode, ObdResponse, ParameterDecoder};
use obd_scheduler::{Correlation, PollScheduler, RequestSink, SchedulerError};
use ring_buffer::{Frame, RingBuffer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::OfflineBuffer;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uds_protocol::ServiceDecoder;

type Queue = Arc<BoundedQueue<Envelope>>;

/// Physical request identifier paired with an ECU response identifier
pub fn request_id_for(response_id: u32) -> Option<u32> {
    match response_id {
        0x7E8..=0x7EF => Some(response_id - 8),
        // 29-bit normal fixed addressing: swap target and source
        id if id & 0x1FFF_0000 == 0x18DA_0000 => {
            let target = (id >> 8) & 0xFF;
            let source = id & 0xFF;
            Some(0x18DA_0000 | (source << 8) | target)
        }
        _ => None,
    }
}

/// Shared epoch for frame receipt stamps
///
/// The router stamps each frame envelope with the time it left the
/// ingestion buffer; the OBD decoder maps that stamp back to an `Instant`
/// so queue backlog does not count against a request's deadline.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptClock {
    origin: Instant,
}

impl ReceiptClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Microseconds since the epoch
    pub fn stamp(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    pub fn instant_at(&self, stamp_us: u64) -> Instant {
        self.origin + Duration::from_micros(stamp_us)
    }
}

impl Default for ReceiptClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Issues scheduler requests through a bus sink
pub struct BusRequests<S> {
    sink: S,
}

impl<S: FrameSink> BusRequests<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S: FrameSink> RequestSink for BusRequests<S> {
    fn send_request(&mut self, id: u32, frame: &[u8; 8]) -> Result<(), SchedulerError> {
        self.sink
            .transmit(id, frame)
            .map_err(|e| SchedulerError::Transmit(e.to_string()))
    }
}

/// Moves frames from the ingestion buffer into the per-protocol queues
pub struct FrameRouterStage<S> {
    ring: Arc<RingBuffer>,
    uds: Queue,
    obd: Queue,
    flow_control: Option<S>,
    config: RouterConfig,
    enqueue_timeout: Duration,
    clock: ReceiptClock,
    router: FrameRouter,
    skipped: u64,
}

impl<S: FrameSink> FrameRouterStage<S> {
    pub fn new(
        ring: Arc<RingBuffer>,
        uds: Queue,
        obd: Queue,
        flow_control: Option<S>,
        config: RouterConfig,
        enqueue_timeout: Duration,
        clock: ReceiptClock,
    ) -> Self {
        Self {
            ring,
            uds,
            obd,
            flow_control,
            config,
            enqueue_timeout,
            clock,
            router: FrameRouter::new(),
            skipped: 0,
        }
    }

    /// Route one drained batch; returns the number of frames taken
    pub async fn route_once(&mut self) -> usize {
        let frames = self.ring.drain(self.config.drain_batch);
        let count = frames.len();
        for frame in frames {
            self.route(frame).await;
        }
        count
    }

    async fn route(&mut self, frame: Frame) {
        let queue = match self.router.classify(&frame) {
            Route::Uds => &self.uds,
            Route::Obd => &self.obd,
            Route::Skip => {
                self.skipped += 1;
                return;
            }
        };

        if FrameRouter::is_first_frame(&frame) {
            if let (Some(sink), Some(target)) = (self.flow_control.as_mut(), request_id_for(frame.id())) {
                if let Err(e) = sink.transmit(target, &isotp::flow_control()) {
                    warn!("Flow control to {:03X} failed: {}", target, e);
                }
            }
        }

        // Drops are counted and logged by the queue
        let envelope = Envelope::new(Stage::Router, self.clock.stamp(), Payload::Frame(frame));
        if let Err(e) = queue.enqueue(envelope, SendMode::Blocking(self.enqueue_timeout)).await {
            debug!("Router: {}", e);
        }
    }

    /// Frames dropped as OBD-II requests or unusable PCI
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Route until shutdown, then empty the ingestion buffer once more
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Frame router started");
        loop {
            if self.route_once().await > 0 {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.idle()) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        while self.route_once().await > 0 {}
        info!("Frame router stopped ({} frames skipped)", self.skipped);
    }
}

/// Output side shared by both decoders
struct DecodeOutput {
    output: Queue,
    enqueue_timeout: Duration,
    errors: ErrorRateTracker,
    health: HealthReporter,
}

impl DecodeOutput {
    fn record(&mut self, success: bool) {
        if let Some(rate) = self.errors.record(success) {
            warn!(
                "{} decode error rate {:.1}% exceeds threshold",
                self.errors.decoder(),
                rate * 100.0
            );
            self.health.report(HealthEvent::DecodeErrorRate {
                decoder: self.errors.decoder().to_string(),
                rate,
            });
        }
    }

    async fn emit(&self, envelope: Envelope) {
        if let Err(e) = self
            .output
            .enqueue(envelope, SendMode::Blocking(self.enqueue_timeout))
            .await
        {
            debug!("{} decoder: {}", self.errors.decoder(), e);
        }
    }
}

/// What one dequeue from a frame queue produced
enum Next {
    /// Nothing arrived within the timeout
    Idle,
    /// Frame absorbed into a multi-frame message
    Partial,
    /// Frame could not be used
    Invalid,
    /// Completed message and the receipt stamp of its last frame
    Message(IsoTpMessage, u64),
}

async fn next_message(input: &Queue, reassembler: &mut Reassembler, timeout: Duration) -> Next {
    let Some(envelope) = input.dequeue(timeout).await else {
        return Next::Idle;
    };
    let kind = envelope.kind();
    let received_us = envelope.timestamp_us;
    let Payload::Frame(frame) = envelope.payload else {
        warn!("Unexpected {} envelope on {}", kind.as_str(), input.name());
        return Next::Invalid;
    };
    match reassembler.push(&frame) {
        Ok(Some(message)) => Next::Message(message, received_us),
        Ok(None) => Next::Partial,
        Err(e) => {
            warn!("ISO-TP error on {:03X}: {}", frame.id(), e);
            Next::Invalid
        }
    }
}

/// UDS decode stage
pub struct UdsDecodeStage {
    input: Queue,
    out: DecodeOutput,
    dequeue_timeout: Duration,
    decoder: ServiceDecoder,
    reassembler: Reassembler,
}

impl UdsDecodeStage {
    pub fn new(
        input: Queue,
        output: Queue,
        errors: ErrorRateTracker,
        health: HealthReporter,
        enqueue_timeout: Duration,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            input,
            out: DecodeOutput {
                output,
                enqueue_timeout,
                errors,
                health,
            },
            dequeue_timeout,
            decoder: ServiceDecoder::new(),
            reassembler: Reassembler::new(),
        }
    }

    /// Process one queue item; false when the queue was idle
    pub async fn process_next(&mut self) -> bool {
        let message = match next_message(&self.input, &mut self.reassembler, self.dequeue_timeout).await {
            Next::Message(message, _) => message,
            Next::Idle => return false,
            Next::Partial => return true,
            Next::Invalid => {
                self.out.record(false);
                return true;
            }
        };

        match self.decoder.decode(&message.data, message.address) {
            Ok(decoded) => {
                self.out.record(true);
                if let Some(vin) = decoded.vin() {
                    info!("ECU {:03X} reports VIN {}", decoded.address, vin);
                }
                if let Some(reason) = decoded.negative_reason() {
                    debug!("{} negative response: {}", decoded.service_name(), reason);
                }
                let envelope = Envelope::new(Stage::UdsDecoder, message.timestamp_us, Payload::Diagnostic(decoded));
                self.out.emit(envelope).await;
            }
            // Already logged with the payload by the decoder
            Err(_) => self.out.record(false),
        }
        true
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("UDS decoder started");
        loop {
            if !self.process_next().await && *shutdown.borrow_and_update() {
                break;
            }
        }
        info!(
            "UDS decoder stopped: {} messages, {} failures",
            self.out.errors.total(),
            self.out.errors.total_failures()
        );
    }
}

/// OBD-II decode stage
pub struct ObdDecodeStage {
    input: Queue,
    out: DecodeOutput,
    dequeue_timeout: Duration,
    decoder: ParameterDecoder,
    reassembler: Reassembler,
    scheduler: Arc<Mutex<PollScheduler>>,
    clock: ReceiptClock,
    stale: u64,
}

impl ObdDecodeStage {
    pub fn new(
        input: Queue,
        output: Queue,
        scheduler: Arc<Mutex<PollScheduler>>,
        clock: ReceiptClock,
        errors: ErrorRateTracker,
        health: HealthReporter,
        enqueue_timeout: Duration,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            input,
            out: DecodeOutput {
                output,
                enqueue_timeout,
                errors,
                health,
            },
            dequeue_timeout,
            decoder: ParameterDecoder::new(),
            reassembler: Reassembler::new(),
            scheduler,
            clock,
            stale: 0,
        }
    }

    /// Stale responses discarded so far
    pub fn stale(&self) -> u64 {
        self.stale
    }

    pub async fn process_next(&mut self) -> bool {
        let (message, received_us) = match next_message(&self.input, &mut self.reassembler, self.dequeue_timeout).await {
            Next::Message(message, received_us) => (message, received_us),
            Next::Idle => return false,
            Next::Partial => return true,
            Next::Invalid => {
                self.out.record(false);
                return true;
            }
        };

        let response = match self.decoder.decode_response(&message.data) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Invalid OBD-II response from {:03X}: {} (payload: {})",
                    message.address,
                    e,
                    hex::encode_upper(&message.data)
                );
                self.out.record(false);
                return true;
            }
        };
        self.out.record(true);

        let payload = match response {
            ObdResponse::Reading(reading) => {
                if reading.mode == mode::CURRENT_DATA {
                    let correlation = self
                        .scheduler
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .correlate(reading.pid, self.clock.instant_at(received_us));
                    if let Correlation::Stale { .. } = correlation {
                        self.stale += 1;
                        return true;
                    }
                }
                Payload::Parameter(reading)
            }
            ObdResponse::StoredFaults { mode, faults } => {
                if !faults.is_empty() {
                    info!("ECU {:03X} reports {} stored faults (mode {:02X})", message.address, faults.len(), mode);
                }
                Payload::StoredFaults {
                    address: message.address,
                    mode,
                    faults,
                }
            }
        };

        self.out
            .emit(Envelope::new(Stage::ObdDecoder, message.timestamp_us, payload))
            .await;
        true
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("OBD-II decoder started");
        loop {
            if !self.process_next().await && *shutdown.borrow_and_update() {
                break;
            }
        }
        info!(
            "OBD-II decoder stopped: {} messages, {} failures, {} stale",
            self.out.errors.total(),
            self.out.errors.total_failures(),
            self.stale
        );
    }
}

/// Feeds decoded envelopes into the offline buffer and seals expired batches
pub async fn run_offline_stage(
    input: Queue,
    buffer: Arc<OfflineBuffer>,
    dequeue_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Offline buffer stage started");
    loop {
        match input.dequeue(dequeue_timeout).await {
            Some(envelope) => {
                if let Err(e) = buffer.admit(envelope).await {
                    error!("Failed to admit envelope: {}", e);
                }
            }
            None if *shutdown.borrow_and_update() => break,
            None => {}
        }
        if let Err(e) = buffer.seal_if_expired().await {
            error!("Failed to seal batch: {}", e);
        }
    }

    match buffer.flush().await {
        Ok(Some(sequence)) => info!("Sealed final batch {}", sequence),
        Ok(None) => {}
        Err(e) => error!("Failed to seal final batch: {}", e),
    }
    info!("Offline buffer stage stopped");
}
