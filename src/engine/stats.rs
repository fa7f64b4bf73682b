//! Per-subscription counters and the statistics snapshot.

use std::time::{Duration, Instant};

/// Monotonic delivery counters, with an optional dispatch-to-ack latency
/// aggregate.
pub struct SubscriptionStats {
    latency_enabled: bool,
    pub dispatched: u64,
    pub acked: u64,
    pub skipped: u64,
    pub parked: u64,
    pub timeouts: u64,
    pub live_dropped: u64,
    latency_count: u64,
    latency_total: Duration,
    latency_max: Duration,
}

impl SubscriptionStats {
    pub fn new(latency_enabled: bool) -> Self {
        Self {
            latency_enabled,
            dispatched: 0,
            acked: 0,
            skipped: 0,
            parked: 0,
            timeouts: 0,
            live_dropped: 0,
            latency_count: 0,
            latency_total: Duration::ZERO,
            latency_max: Duration::ZERO,
        }
    }

    pub fn record_ack(&mut self, dispatched_at: Instant, now: Instant) {
        self.acked += 1;
        if self.latency_enabled {
            let latency = now.saturating_duration_since(dispatched_at);
            self.latency_count += 1;
            self.latency_total += latency;
            self.latency_max = self.latency_max.max(latency);
        }
    }

    pub fn latency(&self) -> Option<LatencySnapshot> {
        if !self.latency_enabled {
            return None;
        }
        Some(LatencySnapshot {
            count: self.latency_count,
            average: if self.latency_count == 0 {
                Duration::ZERO
            } else {
                self.latency_total / self.latency_count as u32
            },
            max: self.latency_max,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub average: Duration,
    pub max: Duration,
}

/// Point-in-time view of a subscription, for admin/status surfaces.
#[derive(Clone, Debug)]
pub struct SubscriptionStatistics {
    pub client_count: usize,
    pub buffered: usize,
    pub in_flight: usize,
    pub parked: usize,
    pub last_acked: Option<u64>,
    pub last_persisted: Option<u64>,
    pub dispatched: u64,
    pub acked: u64,
    pub skipped: u64,
    pub parked_total: u64,
    pub timeouts: u64,
    pub live_dropped: u64,
    pub latency: Option<LatencySnapshot>,
}
