// ABOUTME: Metrics for the HTTPS client pool registry
//
// Tracks:
// - Pools: created
// - Requests: total, failed, in flight
// - Clients: replaced after errors

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Registry-level counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub pools_created: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub requests_in_flight: AtomicU64,
    pub clients_replaced: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_created(&self) {
        self.pools_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_started(&self) {
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_error(&self) {
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clients_replaced(&self, count: usize) {
        self.clients_replaced
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pools_created: self.pools_created.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_in_flight: self.requests_in_flight.load(Ordering::Relaxed),
            clients_replaced: self.clients_replaced.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of `PoolMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pools_created: u64,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub requests_in_flight: u64,
    pub clients_replaced: u64,
}
