//! Poll Scheduler Implementation

use crate::{validate_entry, ObdConfig, RequestSink, SchedulerError};
use obd_protocol::{encode_mode_request, encode_request, mode, pid};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on how long the poller sleeps between checks
const MAX_IDLE: Duration = Duration::from_millis(100);

/// Result of matching a response to an outstanding request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Answered before the deadline
    Fresh { latency: Duration },
    /// Answered after the deadline; discard
    Stale { late_by: Duration },
    /// No outstanding request for this PID
    Unsolicited,
}

impl Correlation {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Correlation::Fresh { .. })
    }
}

#[derive(Debug, Clone)]
struct PollEntry {
    interval: Duration,
    next_due: Instant,
    enabled: bool,
    requests: u64,
    responses: u64,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    sent_at: Instant,
    deadline: Instant,
}

/// Per-PID counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PidStats {
    pub pid: u8,
    pub name: &'static str,
    pub interval_ms: u64,
    pub enabled: bool,
    pub requests: u64,
    pub responses: u64,
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub requests_sent: u64,
    pub fresh: u64,
    pub stale: u64,
    pub unsolicited: u64,
    /// Requests replaced before any response arrived
    pub unanswered: u64,
    pub send_errors: u64,
    pub pids: Vec<PidStats>,
}

/// Interval scheduler over the configured PIDs
pub struct PollScheduler {
    request_id: u32,
    response_timeout: Duration,
    entries: BTreeMap<u8, PollEntry>,
    outstanding: HashMap<u8, Outstanding>,
    fault_interval: Option<Duration>,
    next_fault_poll: Instant,
    stats: SchedulerStats,
}

impl PollScheduler {
    pub fn new(config: &ObdConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let now = Instant::now();

        let entries = config
            .pids
            .iter()
            .map(|spec| {
                (
                    spec.pid,
                    PollEntry {
                        interval: Duration::from_millis(spec.interval_ms),
                        next_due: now,
                        enabled: spec.enabled,
                        requests: 0,
                        responses: 0,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        let fault_interval = match config.fault_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        info!(
            "Poll scheduler created with {} PIDs (request id {:03X}, timeout {} ms)",
            entries.len(),
            config.request_id,
            config.response_timeout_ms
        );

        Ok(Self {
            request_id: config.request_id,
            response_timeout: config.response_timeout(),
            entries,
            outstanding: HashMap::new(),
            fault_interval,
            next_fault_poll: now,
            stats: SchedulerStats::default(),
        })
    }

    pub fn add_pid(&mut self, pid: u8, interval_ms: u64) -> Result<(), SchedulerError> {
        validate_entry(pid, interval_ms)?;
        if self.entries.contains_key(&pid) {
            return Err(SchedulerError::DuplicatePid(pid));
        }
        self.entries.insert(
            pid,
            PollEntry {
                interval: Duration::from_millis(interval_ms),
                next_due: Instant::now(),
                enabled: true,
                requests: 0,
                responses: 0,
            },
        );
        info!("Added PID {:02X} at {} ms", pid, interval_ms);
        Ok(())
    }

    pub fn remove_pid(&mut self, pid: u8) -> Result<(), SchedulerError> {
        self.entries.remove(&pid).ok_or(SchedulerError::NotScheduled(pid))?;
        self.outstanding.remove(&pid);
        info!("Removed PID {:02X}", pid);
        Ok(())
    }

    pub fn enable(&mut self, pid: u8) -> Result<(), SchedulerError> {
        let entry = self.entry_mut(pid)?;
        if !entry.enabled {
            entry.enabled = true;
            entry.next_due = Instant::now();
            debug!("Enabled PID {:02X}", pid);
        }
        Ok(())
    }

    pub fn disable(&mut self, pid: u8) -> Result<(), SchedulerError> {
        self.entry_mut(pid)?.enabled = false;
        self.outstanding.remove(&pid);
        debug!("Disabled PID {:02X}", pid);
        Ok(())
    }

    pub fn set_interval(&mut self, pid: u8, interval_ms: u64) -> Result<(), SchedulerError> {
        validate_entry(pid, interval_ms)?;
        let entry = self.entry_mut(pid)?;
        let interval = Duration::from_millis(interval_ms);
        // Pull the next request forward if the new interval is shorter
        let last_sent = entry.next_due.checked_sub(entry.interval);
        entry.interval = interval;
        if let Some(last) = last_sent {
            entry.next_due = entry.next_due.min(last + interval);
        }
        debug!("PID {:02X} interval set to {} ms", pid, interval_ms);
        Ok(())
    }

    fn entry_mut(&mut self, pid: u8) -> Result<&mut PollEntry, SchedulerError> {
        self.entries.get_mut(&pid).ok_or(SchedulerError::NotScheduled(pid))
    }

    /// Earliest instant something needs sending
    pub fn next_due(&self) -> Option<Instant> {
        let pids = self.entries.values().filter(|e| e.enabled).map(|e| e.next_due);
        let faults = self.fault_interval.map(|_| self.next_fault_poll);
        pids.chain(faults).min()
    }

    /// Send every request due at `now`. Transmit failures are counted and
    /// logged; the entry still waits a full interval before its next attempt.
    pub fn poll_due<S: RequestSink + ?Sized>(&mut self, now: Instant, sink: &mut S) -> usize {
        let mut sent = 0;

        let due: Vec<u8> = self
            .entries
            .iter()
            .filter(|(_, e)| e.enabled && e.next_due <= now)
            .map(|(pid, _)| *pid)
            .collect();

        for pid in due {
            let request = encode_request(mode::CURRENT_DATA, pid);
            let result = sink.send_request(self.request_id, &request);

            if let Some(entry) = self.entries.get_mut(&pid) {
                entry.next_due = now + entry.interval;
                if result.is_ok() {
                    entry.requests += 1;
                }
            }

            match result {
                Ok(()) => {
                    let previous = self.outstanding.insert(
                        pid,
                        Outstanding {
                            sent_at: now,
                            deadline: now + self.response_timeout,
                        },
                    );
                    if previous.is_some() {
                        self.stats.unanswered += 1;
                        debug!("PID {:02X}: previous request never answered", pid);
                    }
                    self.stats.requests_sent += 1;
                    sent += 1;
                }
                Err(e) => {
                    self.stats.send_errors += 1;
                    warn!("PID {:02X} request failed: {}", pid, e);
                }
            }
        }

        if let Some(interval) = self.fault_interval {
            if self.next_fault_poll <= now {
                self.next_fault_poll = now + interval;
                match sink.send_request(self.request_id, &encode_mode_request(mode::READ_DTC)) {
                    Ok(()) => {
                        self.stats.requests_sent += 1;
                        sent += 1;
                    }
                    Err(e) => {
                        self.stats.send_errors += 1;
                        warn!("Stored fault request failed: {}", e);
                    }
                }
            }
        }

        sent
    }

    /// Match a Mode 01 response for `pid` that reached the gateway at `now`
    pub fn correlate(&mut self, pid: u8, now: Instant) -> Correlation {
        let Some(outstanding) = self.outstanding.remove(&pid) else {
            self.stats.unsolicited += 1;
            debug!("Unsolicited response for PID {:02X}", pid);
            return Correlation::Unsolicited;
        };

        if now > outstanding.deadline {
            let late_by = now - outstanding.deadline;
            self.stats.stale += 1;
            warn!("Discarding stale response for PID {:02X} ({:?} past deadline)", pid, late_by);
            return Correlation::Stale { late_by };
        }

        self.stats.fresh += 1;
        if let Some(entry) = self.entries.get_mut(&pid) {
            entry.responses += 1;
        }
        Correlation::Fresh {
            latency: now.saturating_duration_since(outstanding.sent_at),
        }
    }

    /// PIDs with a request in flight
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn pid_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats.clone();
        stats.pids = self
            .entries
            .iter()
            .map(|(pid, e)| PidStats {
                pid: *pid,
                name: pid::lookup(*pid).map(|s| s.name).unwrap_or("unknown"),
                interval_ms: e.interval.as_millis() as u64,
                enabled: e.enabled,
                requests: e.requests,
                responses: e.responses,
            })
            .collect();
        stats
    }
}

/// Drive a shared scheduler until shutdown. The lock is held only while
/// requests are issued, so the decoder can correlate in between.
pub async fn run_poller<S: RequestSink>(
    scheduler: Arc<Mutex<PollScheduler>>,
    mut sink: S,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("OBD poller started");
    loop {
        let wake = {
            let mut guard = scheduler.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            guard.poll_due(now, &mut sink);
            guard
                .next_due()
                .map(|due| due.min(now + MAX_IDLE))
                .unwrap_or(now + MAX_IDLE)
        };

        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
    info!("OBD poller stopped");
}
