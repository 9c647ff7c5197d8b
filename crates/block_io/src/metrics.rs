//! Diagnostics counters injected into the engine.
//!
//! An [`IoMetrics`] is owned by the caller and handed to the engine through
//! [`EngineConfig::metrics`](crate::EngineConfig::metrics), so several engines
//! can report into one collector without process-wide globals.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters describing engine activity.
#[derive(Debug, Default)]
pub struct IoMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    batches_submitted: AtomicU64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    slow_batches: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    peak_foreground_in_flight: AtomicU64,
    peak_background_in_flight: AtomicU64,
}

/// Point-in-time copy of [`IoMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Bytes the device reported written.
    pub bytes_sent: u64,
    /// Bytes the device reported read.
    pub bytes_received: u64,
    /// Device submissions, including copy write phases and continuations.
    pub batches_submitted: u64,
    /// Batches returned to the pool.
    pub batches_completed: u64,
    /// Batches that ended with a device error.
    pub batches_failed: u64,
    /// Batches slower than the configured threshold.
    pub slow_batches: u64,
    /// Requests completed successfully.
    pub requests_completed: u64,
    /// Requests completed with an error other than cancellation.
    pub requests_failed: u64,
    /// Requests completed as cancelled.
    pub requests_cancelled: u64,
    /// Highest number of foreground batches observed in flight.
    pub peak_foreground_in_flight: u64,
    /// Highest number of background batches observed in flight.
    pub peak_background_in_flight: u64,
}

impl IoMetrics {
    /// Creates a zeroed collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submit(&self) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_done(&self, failed: bool) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_slow_batch(&self) {
        self.slow_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request(&self, succeeded: bool, cancelled: bool) {
        let counter = if succeeded {
            &self.requests_completed
        } else if cancelled {
            &self.requests_cancelled
        } else {
            &self.requests_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_in_flight(&self, foreground: usize, background: usize) {
        self.peak_foreground_in_flight
            .fetch_max(foreground as u64, Ordering::Relaxed);
        self.peak_background_in_flight
            .fetch_max(background as u64, Ordering::Relaxed);
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            slow_batches: self.slow_batches.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            peak_foreground_in_flight: self.peak_foreground_in_flight.load(Ordering::Relaxed),
            peak_background_in_flight: self.peak_background_in_flight.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transferred_bytes_split_by_direction() {
        let metrics = IoMetrics::new();
        for _ in 0..3 {
            metrics.record_submit();
        }
        metrics.record_written(4096);
        metrics.record_read(512);
        metrics.record_read(512);

        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_sent, 4096);
        assert_eq!(snap.bytes_received, 1024);
        assert_eq!(snap.batches_submitted, 3);
    }

    #[test]
    fn peaks_only_grow() {
        let metrics = IoMetrics::new();
        metrics.observe_in_flight(3, 1);
        metrics.observe_in_flight(1, 2);

        let snap = metrics.snapshot();
        assert_eq!(snap.peak_foreground_in_flight, 3);
        assert_eq!(snap.peak_background_in_flight, 2);
    }

    #[test]
    fn request_outcomes_are_classified() {
        let metrics = IoMetrics::new();
        metrics.record_request(true, false);
        metrics.record_request(false, true);
        metrics.record_request(false, false);

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_completed, 1);
        assert_eq!(snap.requests_cancelled, 1);
        assert_eq!(snap.requests_failed, 1);
    }
}
