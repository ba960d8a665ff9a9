//! Traffic statistics by message type.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one message type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficCounters {
    /// Requests sent over outgoing channels
    pub requests_sent: u64,
    /// Content bytes sent
    pub bytes_sent: u64,
    /// Requests received from neighbours
    pub requests_received: u64,
    /// Content bytes received
    pub bytes_received: u64,
    /// Received requests forwarded towards another node
    pub forwarded: u64,
    /// Received requests handled locally
    pub delivered: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    requests_sent: AtomicU64,
    bytes_sent: AtomicU64,
    requests_received: AtomicU64,
    bytes_received: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
}

/// Message and byte counts, kept for observation only
#[derive(Debug, Default)]
pub struct TrafficStats {
    by_type: DashMap<String, AtomicCounters>,
}

impl TrafficStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counters(&self, message_type: &str, f: impl FnOnce(&AtomicCounters)) {
        if let Some(counters) = self.by_type.get(message_type) {
            f(&*counters);
            return;
        }
        let entry = self.by_type.entry(message_type.to_string()).or_default();
        f(&*entry);
    }

    /// Count an outgoing request
    pub fn record_sent(&self, message_type: &str, bytes: usize) {
        self.with_counters(message_type, |c| {
            c.requests_sent.fetch_add(1, Ordering::Relaxed);
            c.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        });
    }

    /// Count an incoming request
    pub fn record_received(&self, message_type: &str, bytes: usize) {
        self.with_counters(message_type, |c| {
            c.requests_received.fetch_add(1, Ordering::Relaxed);
            c.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        });
    }

    /// Count an incoming request that was forwarded
    pub fn record_forwarded(&self, message_type: &str) {
        self.with_counters(message_type, |c| {
            c.forwarded.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Count an incoming request handled locally
    pub fn record_delivered(&self, message_type: &str) {
        self.with_counters(message_type, |c| {
            c.delivered.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> BTreeMap<String, TrafficCounters> {
        self.by_type
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    entry.key().clone(),
                    TrafficCounters {
                        requests_sent: c.requests_sent.load(Ordering::Relaxed),
                        bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
                        requests_received: c.requests_received.load(Ordering::Relaxed),
                        bytes_received: c.bytes_received.load(Ordering::Relaxed),
                        forwarded: c.forwarded.load(Ordering::Relaxed),
                        delivered: c.delivered.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}
