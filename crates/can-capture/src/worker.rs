//! Capture worker
//!
//! Dedicated OS thread that polls a `FrameSource` and pushes every frame
//! into the ingestion buffer. Adapter reads are synchronous, so this stays
//! off the async runtime.

use crate::{CaptureConfig, CaptureError, FrameSource};
use ring_buffer::RingBuffer;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Adapter link health as seen by the capture thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Degraded(String),
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    errors: AtomicU64,
}

/// Spawns the capture thread
pub struct CaptureWorker;

impl CaptureWorker {
    pub fn spawn<S>(
        source: S,
        buffer: Arc<RingBuffer>,
        config: &CaptureConfig,
    ) -> Result<CaptureHandle, CaptureError>
    where
        S: FrameSource + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let (link_tx, link_rx) = watch::channel(LinkState::Up);

        let idle = Duration::from_millis(config.idle_ms);
        let backoff = Duration::from_millis(config.error_backoff_ms);
        let channel = config.channel;
        let thread = {
            let shutdown = shutdown.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name("can-capture".into())
                .spawn(move || capture_loop(source, buffer, channel, shutdown, counters, link_tx, idle, backoff))
                .map_err(|e| CaptureError::Disconnected(format!("failed to spawn capture thread: {}", e)))?
        };

        info!("Capture worker started (channel {})", config.channel);
        Ok(CaptureHandle {
            shutdown,
            counters,
            link: link_rx,
            thread: Some(thread),
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_loop<S: FrameSource>(
    mut source: S,
    buffer: Arc<RingBuffer>,
    channel: u8,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
    link: watch::Sender<LinkState>,
    idle: Duration,
    backoff: Duration,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match source.read_frame() {
            Ok(Some(frame)) => {
                counters.frames.fetch_add(1, Ordering::Relaxed);
                link.send_if_modified(|state| {
                    if *state != LinkState::Up {
                        info!("CAN adapter recovered");
                        *state = LinkState::Up;
                        true
                    } else {
                        false
                    }
                });
                // Rejections are counted and logged by the buffer itself
                let _ = buffer.push(frame.on_channel(channel));
            }
            Ok(None) => {
                // No data, brief sleep
                std::thread::sleep(idle);
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                let reason = e.to_string();
                link.send_if_modified(|state| match state {
                    LinkState::Degraded(current) if *current == reason => false,
                    _ => {
                        warn!("CAN read error: {}", reason);
                        *state = LinkState::Degraded(reason.clone());
                        true
                    }
                });
                std::thread::sleep(backoff);
            }
        }
    }
    debug!("Capture loop exiting");
}

/// Owner handle for a running capture thread; dropping it stops the thread
pub struct CaptureHandle {
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
    link: watch::Receiver<LinkState>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Subscribe to adapter link state changes
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    /// Frames read from the adapter (accepted or not)
    pub fn frames_read(&self) -> u64 {
        self.counters.frames.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.counters.errors.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait for it to finish its current read
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
            info!(
                "Capture worker stopped: {} frames, {} read errors",
                self.frames_read(),
                self.read_errors()
            );
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
