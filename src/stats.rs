//! Per-destination transfer statistics.
//!
//! Byte counters are plain relaxed atomics; a snapshot reads them
//! independently, so the two counters are not guaranteed to be consistent
//! with each other. Round-trip latency is averaged over a sliding window of
//! the most recent completed requests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Number of completed requests the latency average covers.
pub const LATENCY_WINDOW: usize = 10;

/// Snapshot returned by [`Client::get_transfer_stats`](crate::Client::get_transfer_stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Mean round trip of the last [`LATENCY_WINDOW`] successful requests.
    /// `None` with statistics disabled or before the first reply.
    pub average_round_trip: Option<Duration>,
}

/// Sliding-window mean over the last `capacity` samples.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
    sum: Duration,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: Duration::ZERO,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(oldest);
            }
        }
        self.samples.push_back(sample);
        self.sum = self.sum.saturating_add(sample);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.sum / self.samples.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

/// Live counters of one connection.
#[derive(Debug, Default)]
pub(crate) struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl ConnectionStats {
    pub(crate) fn add_sent(&self, n: u64) {
        if n > 0 {
            self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_received(&self, n: u64) {
        if n > 0 {
            self.bytes_received.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_round_trip(&self, sample: Duration) {
        self.latency.lock().record(sample);
    }

    pub(crate) fn snapshot(&self) -> TransferStats {
        TransferStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            average_round_trip: self.latency.lock().average(),
        }
    }
}
