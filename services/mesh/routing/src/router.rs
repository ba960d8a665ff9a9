//! Router trait and routing decision types

use async_trait::async_trait;
use dashmap::DashMap;
use mesh_wire::{NetworkRequest, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Requests that travelled this many hops are dropped
pub const MAX_HOP_COUNT: u32 = 32;

/// Routing decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Deliver locally (we are the destination)
    Local,
    /// Send over the outgoing channel `channel_id` to the neighbour `next_hop`
    Forward {
        /// Neighbour the request is sent to
        next_hop: NodeId,
        /// Channel backing the first link of the route
        channel_id: String,
    },
    /// Drop the request
    Drop(DropReason),
}

/// Reason for dropping a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DropReason {
    /// No route to destination
    NoRoute,
    /// Hop limit reached
    HopLimitExceeded,
    /// The request already passed through this node
    RoutingLoop,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoRoute => write!(f, "no route to destination"),
            DropReason::HopLimitExceeded => write!(f, "hop limit exceeded"),
            DropReason::RoutingLoop => write!(f, "routing loop detected"),
        }
    }
}

/// Router trait for making routing decisions
#[async_trait]
pub trait Router: Send + Sync {
    /// Make a routing decision for a request at this node
    async fn decide(&self, request: &NetworkRequest) -> RoutingDecision;

    /// Get the local node ID
    fn local_node_id(&self) -> &NodeId;

    /// Check if a destination is reachable
    async fn is_reachable(&self, destination: &NodeId) -> bool;

    /// Get routing statistics
    fn stats(&self) -> RouterStats;
}

/// Router statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    /// Number of routing decisions made
    pub decisions_made: u64,
    /// Number of requests forwarded
    pub requests_forwarded: u64,
    /// Number of requests delivered locally
    pub requests_local: u64,
    /// Number of requests dropped
    pub requests_dropped: u64,
    /// Number of forwarded requests that timed out
    pub forwarding_timeouts: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: BTreeMap<DropReason, u64>,
}

/// Lock-free counters behind [`RouterStats`]
#[derive(Debug, Default)]
pub(crate) struct RouterCounters {
    decisions: AtomicU64,
    forwarded: AtomicU64,
    local: AtomicU64,
    dropped: AtomicU64,
    forwarding_timeouts: AtomicU64,
    drop_reasons: DashMap<DropReason, AtomicU64>,
}

impl RouterCounters {
    pub(crate) fn record(&self, decision: &RoutingDecision) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        match decision {
            RoutingDecision::Local => {
                self.local.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::Forward { .. } => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::Drop(reason) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.drop_reasons
                    .entry(*reason)
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn record_forwarding_timeout(&self) {
        self.forwarding_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RouterStats {
        RouterStats {
            decisions_made: self.decisions.load(Ordering::Relaxed),
            requests_forwarded: self.forwarded.load(Ordering::Relaxed),
            requests_local: self.local.load(Ordering::Relaxed),
            requests_dropped: self.dropped.load(Ordering::Relaxed),
            forwarding_timeouts: self.forwarding_timeouts.load(Ordering::Relaxed),
            drop_reasons: self
                .drop_reasons
                .iter()
                .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = RouterCounters::default();
        counters.record(&RoutingDecision::Local);
        counters.record(&RoutingDecision::Forward {
            next_hop: NodeId::new("b").unwrap(),
            channel_id: "c1".into(),
        });
        counters.record(&RoutingDecision::Drop(DropReason::NoRoute));
        counters.record(&RoutingDecision::Drop(DropReason::NoRoute));
        counters.record(&RoutingDecision::Drop(DropReason::RoutingLoop));
        counters.record_forwarding_timeout();

        let stats = counters.snapshot();
        assert_eq!(stats.decisions_made, 5);
        assert_eq!(stats.requests_local, 1);
        assert_eq!(stats.requests_forwarded, 1);
        assert_eq!(stats.requests_dropped, 3);
        assert_eq!(stats.forwarding_timeouts, 1);
        assert_eq!(stats.drop_reasons[&DropReason::NoRoute], 2);
        assert_eq!(stats.drop_reasons[&DropReason::RoutingLoop], 1);
    }

    #[test]
    fn test_drop_reason_display() {
        assert_eq!(DropReason::NoRoute.to_string(), "no route to destination");
        assert_eq!(DropReason::HopLimitExceeded.to_string(), "hop limit exceeded");
    }
}
