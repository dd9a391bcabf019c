//! Decode error-rate tracking

use std::collections::VecDeque;
use tracing::{info, warn};

/// Outcomes needed before the rate is trusted
const MIN_SAMPLES: usize = 20;

/// Sliding-window failure rate for one decoder
#[derive(Debug, Clone)]
pub struct ErrorRateTracker {
    decoder: String,
    threshold: f64,
    window: usize,
    outcomes: VecDeque<bool>,
    failures_in_window: usize,
    total: u64,
    total_failures: u64,
    alarmed: bool,
}

impl ErrorRateTracker {
    pub fn new(decoder: impl Into<String>, threshold: f64, window: usize) -> Self {
        let window = window.max(1);
        Self {
            decoder: decoder.into(),
            threshold,
            window,
            outcomes: VecDeque::with_capacity(window),
            failures_in_window: 0,
            total: 0,
            total_failures: 0,
            alarmed: false,
        }
    }

    /// Record one decode attempt. Returns the current rate when it first
    /// exceeds the threshold; stays quiet until it drops back below.
    pub fn record(&mut self, success: bool) -> Option<f64> {
        if self.outcomes.len() == self.window {
            if let Some(false) = self.outcomes.pop_front() {
                self.failures_in_window -= 1;
            }
        }
        self.outcomes.push_back(success);
        self.total += 1;
        if !success {
            self.failures_in_window += 1;
            self.total_failures += 1;
        }

        if self.outcomes.len() < MIN_SAMPLES.min(self.window) {
            return None;
        }

        let rate = self.rate();
        if !self.alarmed && rate > self.threshold {
            self.alarmed = true;
            warn!(
                "{} decode error rate {:.1}% exceeds {:.1}%",
                self.decoder,
                rate * 100.0,
                self.threshold * 100.0
            );
            return Some(rate);
        }
        if self.alarmed && rate <= self.threshold {
            self.alarmed = false;
            info!("{} decode error rate back to {:.1}%", self.decoder, rate * 100.0);
        }
        None
    }

    /// Failure fraction over the window
    pub fn rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.failures_in_window as f64 / self.outcomes.len() as f64
    }

    pub fn decoder(&self) -> &str {
        &self.decoder
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn is_alarmed(&self) -> bool {
        self.alarmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_alert_after_threshold() {
        let mut tracker = ErrorRateTracker::new("uds", 0.05, 200);
        for _ in 0..95 {
            assert_eq!(tracker.record(true), None);
        }
        // 5 failures in 100 is exactly 5%, not above it
        for _ in 0..5 {
            assert_eq!(tracker.record(false), None);
        }
        let rate = tracker.record(false).unwrap();
        assert!((rate - 6.0 / 101.0).abs() < 1e-9);

        // No repeat while still above
        assert_eq!(tracker.record(false), None);
        assert!(tracker.is_alarmed());
    }

    #[test]
    fn test_needs_minimum_samples() {
        let mut tracker = ErrorRateTracker::new("obd", 0.05, 200);
        for _ in 0..MIN_SAMPLES - 1 {
            assert_eq!(tracker.record(false), None);
        }
        assert!(tracker.record(false).is_some());
    }

    #[test]
    fn test_window_slides() {
        let mut tracker = ErrorRateTracker::new("uds", 0.5, 20);
        for _ in 0..20 {
            tracker.record(false);
        }
        assert_eq!(tracker.rate(), 1.0);
        for _ in 0..20 {
            tracker.record(true);
        }
        assert_eq!(tracker.rate(), 0.0);
        assert!(!tracker.is_alarmed());
        assert_eq!(tracker.total(), 40);
        assert_eq!(tracker.total_failures(), 20);
    }

    proptest! {
        #[test]
        fn prop_rate_matches_window(outcomes in proptest::collection::vec(any::<bool>(), 0..500)) {
            let mut tracker = ErrorRateTracker::new("x", 0.05, 50);
            for &ok in &outcomes {
                tracker.record(ok);
            }
            let tail: Vec<bool> = outcomes.iter().rev().take(50).copied().collect();
            let expected = if tail.is_empty() {
                0.0
            } else {
                tail.iter().filter(|ok| !**ok).count() as f64 / tail.len() as f64
            };
            prop_assert!((tracker.rate() - expected).abs() < 1e-12);
        }
    }
}
