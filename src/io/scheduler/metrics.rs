//! I/O metrics collection for the scheduler
//!
//! Latency histograms, counters and gauges. Everything is atomic so the
//! metrics can be shared with threads that only read them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::OpKind;

/// Number of histogram buckets
const HISTOGRAM_BUCKETS: usize = 8;

/// Upper bound of each bucket in microseconds
const BUCKET_BOUNDS_US: [u64; HISTOGRAM_BUCKETS] =
    [100, 500, 1000, 5000, 10000, 50000, 100000, u64::MAX];

/// Latency histogram with fixed buckets
///
/// Buckets: <100us, <500us, <1ms, <5ms, <10ms, <50ms, <100ms, >=100ms
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
    /// Sum of all latencies in microseconds
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub const fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; HISTOGRAM_BUCKETS],
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a latency value
    pub fn record(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let bucket = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| us < bound)
            .unwrap_or(HISTOGRAM_BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn average(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_us.load(Ordering::Relaxed) / count)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Estimate a percentile
    ///
    /// Returns the upper bound of the bucket containing the percentile.
    pub fn percentile(&self, p: f64) -> Duration {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }

        let target = ((total as f64 * p / 100.0).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (bucket, bound) in self.buckets.iter().zip(BUCKET_BOUNDS_US) {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return Duration::from_micros(bound);
            }
        }
        Duration::from_micros(BUCKET_BOUNDS_US[HISTOGRAM_BUCKETS - 2])
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }

    /// Get bucket counts as array
    pub fn buckets(&self) -> [u64; HISTOGRAM_BUCKETS] {
        std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// I/O metrics for the scheduler
#[derive(Debug)]
pub struct IoMetrics {
    // Counters
    /// Requests accepted by `submit`
    pub requests_submitted: AtomicU64,
    /// Requests whose completion callback has run
    pub requests_completed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Batches handed to the backend
    pub batches_submitted: AtomicU64,
    /// Backend submissions retried after transient backpressure
    pub submit_retries: AtomicU64,
    /// Requests admitted from the conflicting bucket
    pub conflicting_pulls: AtomicU64,

    // Gauges
    /// Requests waiting in the reorder queue
    pub queued: AtomicU32,
    /// Requests admitted and not yet completed
    pub in_flight_ops: AtomicU32,

    // Per-kind latency, measured from admission to completion
    pub read_latency: LatencyHistogram,
    pub write_latency: LatencyHistogram,
}

impl IoMetrics {
    pub const fn new() -> Self {
        Self {
            requests_submitted: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            batches_submitted: AtomicU64::new(0),
            submit_retries: AtomicU64::new(0),
            conflicting_pulls: AtomicU64::new(0),
            queued: AtomicU32::new(0),
            in_flight_ops: AtomicU32::new(0),
            read_latency: LatencyHistogram::new(),
            write_latency: LatencyHistogram::new(),
        }
    }

    /// Record a new request entering the queue
    pub fn record_submit(&self) {
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request leaving the queue for the backend
    pub fn record_admit(&self, from_conflicting: bool) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.in_flight_ops.fetch_add(1, Ordering::Relaxed);
        if from_conflicting {
            self.conflicting_pulls.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record queued requests dropped at shutdown
    pub fn record_discard(&self, n: usize) {
        self.queued.fetch_sub(n as u32, Ordering::Relaxed);
    }

    /// Record a completed I/O operation
    pub fn record_completion(&self, kind: OpKind, latency: Duration, bytes: usize) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.in_flight_ops.fetch_sub(1, Ordering::Relaxed);
        match kind {
            OpKind::Read => {
                self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
                self.read_latency.record(latency);
            }
            OpKind::Write => {
                self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
                self.write_latency.record(latency);
            }
        }
    }

    /// Record a batch accepted by the backend
    pub fn record_batch(&self) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a submission retried after backpressure
    pub fn record_retry(&self) {
        self.submit_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the latency histogram for an operation kind
    pub fn latency_for(&self, kind: OpKind) -> &LatencyHistogram {
        match kind {
            OpKind::Read => &self.read_latency,
            OpKind::Write => &self.write_latency,
        }
    }

    /// Take a snapshot of current metrics
    pub fn snapshot(&self) -> IoMetricsSnapshot {
        IoMetricsSnapshot {
            requests_submitted: self.requests_submitted.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            submit_retries: self.submit_retries.load(Ordering::Relaxed),
            conflicting_pulls: self.conflicting_pulls.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            in_flight_ops: self.in_flight_ops.load(Ordering::Relaxed),
            read_avg: self.read_latency.average(),
            read_p99: self.read_latency.p99(),
            write_avg: self.write_latency.average(),
            write_p99: self.write_latency.p99(),
        }
    }
}

impl Default for IoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of I/O metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoMetricsSnapshot {
    pub requests_submitted: u64,
    pub requests_completed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub batches_submitted: u64,
    pub submit_retries: u64,
    pub conflicting_pulls: u64,
    pub queued: u32,
    pub in_flight_ops: u32,
    pub read_avg: Duration,
    pub read_p99: Duration,
    pub write_avg: Duration,
    pub write_p99: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_recording() {
        let hist = LatencyHistogram::new();

        hist.record(Duration::from_micros(50)); // <100us
        hist.record(Duration::from_micros(300)); // <500us
        hist.record(Duration::from_millis(3)); // <5ms
        hist.record(Duration::from_secs(1)); // >=100ms

        assert_eq!(hist.count(), 4);
        assert_eq!(hist.buckets(), [1, 1, 0, 1, 0, 0, 0, 1]);
        assert_eq!(hist.p50(), Duration::from_micros(500));
    }

    #[test]
    fn test_request_lifecycle_gauges() {
        let metrics = IoMetrics::new();
        metrics.record_submit();
        metrics.record_submit();
        metrics.record_admit(true);
        metrics.record_completion(OpKind::Write, Duration::from_micros(200), 4096);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_submitted, 2);
        assert_eq!(snapshot.requests_completed, 1);
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.in_flight_ops, 0);
        assert_eq!(snapshot.conflicting_pulls, 1);
        assert_eq!(snapshot.bytes_written, 4096);
        assert_eq!(snapshot.bytes_read, 0);
        assert_eq!(snapshot.write_avg, Duration::from_micros(200));
    }
}
