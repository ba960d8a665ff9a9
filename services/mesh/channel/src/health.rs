//! Per-channel health state and the health-check probe.

use crate::handler::NetworkRequestHandler;
use async_trait::async_trait;
use mesh_wire::{NetworkRequest, NetworkResponse, NodeId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Health bookkeeping of one channel, owned by the channel service
#[derive(Debug, Default)]
pub struct HealthState {
    /// Serializes checks of the same channel
    pub(crate) check_lock: Mutex<()>,
    consecutive_failures: AtomicU32,
}

impl HealthState {
    /// Current number of consecutive failed checks
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Record a failure; returns the new failure count
    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a success; returns the failure count before the reset
    pub(crate) fn record_success(&self) -> u32 {
        self.consecutive_failures.swap(0, Ordering::AcqRel)
    }
}

/// Result of one scheduled health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    /// The probe round trip succeeded
    Passed,
    /// The probe failed
    Failed {
        /// Failures in a row, including this one
        consecutive_failures: u32,
        /// Whether the failure limit was reached and the channel is being marked broken
        marked_broken: bool,
    },
    /// The channel was not ready, already gone, or closed during the check
    Skipped,
}

/// Content of a health-check request; the response must echo it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckToken(pub String);

impl HealthCheckToken {
    /// Generate a random token
    pub fn random() -> Self {
        let value: u64 = rand::thread_rng().gen();
        Self(format!("{value:016x}"))
    }
}

/// Random delay in `[0, max]` spreading checks of different channels apart
pub fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Answers health checks by echoing the token
pub struct HealthCheckHandler;

#[async_trait]
impl NetworkRequestHandler for HealthCheckHandler {
    async fn handle_request(
        &self,
        request: &NetworkRequest,
        _last_hop: &NodeId,
    ) -> anyhow::Result<NetworkResponse> {
        let token: HealthCheckToken = request.deserialize_content()?;
        Ok(NetworkResponse::success_with_payload(request, &token)?)
    }
}
