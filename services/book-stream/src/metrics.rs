//! Observability counters for the streaming service
//!
//! Plain atomics bumped on the hot paths and exported as a sorted map on the
//! `/health` endpoint. Fan-out latency is sampled into a bounded window so
//! the p99 of `publish` can be watched without a metrics backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core metrics for the streaming service.
pub struct StreamMetrics {
    // Connections
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,

    // Client requests
    pub subscribe_requests: AtomicU64,
    pub unsubscribe_requests: AtomicU64,
    pub rejected_requests: AtomicU64,

    // Fan-out
    pub updates_published: AtomicU64,
    pub messages_enqueued: AtomicU64,
    pub messages_conflated: AtomicU64,
    pub messages_superseded: AtomicU64,
    pub messages_dropped_backpressure: AtomicU64,
    pub backpressure_disconnects: AtomicU64,
    pub publish_latency_ns: Mutex<LatencyTracker>,

    // Ingestion
    pub snapshots_ingested: AtomicU64,
    pub snapshots_stale: AtomicU64,
    pub snapshots_rejected: AtomicU64,
    pub feed_errors: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            subscribe_requests: AtomicU64::new(0),
            unsubscribe_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            updates_published: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            messages_conflated: AtomicU64::new(0),
            messages_superseded: AtomicU64::new(0),
            messages_dropped_backpressure: AtomicU64::new(0),
            backpressure_disconnects: AtomicU64::new(0),
            publish_latency_ns: Mutex::new(LatencyTracker::new(1000)),
            snapshots_ingested: AtomicU64::new(0),
            snapshots_stale: AtomicU64::new(0),
            snapshots_rejected: AtomicU64::new(0),
            feed_errors: AtomicU64::new(0),
        }
    }

    /// Bump a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one fan-out pass.
    pub fn record_publish(&self, latency_ns: u64) {
        self.updates_published.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.publish_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    /// Connections currently open, derived from open/close counters.
    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    /// Export metrics as a sorted map for the health endpoint.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 15] = [
            ("connections_opened", &self.connections_opened),
            ("connections_closed", &self.connections_closed),
            ("subscribe_requests", &self.subscribe_requests),
            ("unsubscribe_requests", &self.unsubscribe_requests),
            ("rejected_requests", &self.rejected_requests),
            ("updates_published", &self.updates_published),
            ("messages_enqueued", &self.messages_enqueued),
            ("messages_conflated", &self.messages_conflated),
            ("messages_superseded", &self.messages_superseded),
            ("messages_dropped_backpressure", &self.messages_dropped_backpressure),
            ("backpressure_disconnects", &self.backpressure_disconnects),
            ("snapshots_ingested", &self.snapshots_ingested),
            ("snapshots_stale", &self.snapshots_stale),
            ("snapshots_rejected", &self.snapshots_rejected),
            ("feed_errors", &self.feed_errors),
        ];

        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect();
        m.insert("active_connections".to_string(), self.active_connections());

        if let Ok(tracker) = self.publish_latency_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                m.insert("publish_latency_p99_ns".to_string(), p99);
            }
        }
        m
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }
}
