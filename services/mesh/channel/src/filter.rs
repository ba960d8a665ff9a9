//! IP allow-list consulted by servers before accepting connections.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::RwLock;
use tracing::info;

#[derive(Debug, Default)]
struct FilterState {
    enabled: bool,
    allowed: BTreeSet<IpAddr>,
}

/// Connection filter; accepts everything while disabled
#[derive(Debug, Default)]
pub struct ConnectionFilter {
    state: RwLock<FilterState>,
}

impl ConnectionFilter {
    /// Create a disabled filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the filter with the given allow-list, or disable it with `None`
    pub fn configure(&self, allowed: Option<Vec<IpAddr>>) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match allowed {
            Some(ips) => {
                state.enabled = true;
                state.allowed = ips.into_iter().collect();
                info!(
                    "Connection filter enabled with {} allowed addresses",
                    state.allowed.len()
                );
            }
            None => {
                state.enabled = false;
                state.allowed.clear();
                info!("Connection filter disabled");
            }
        }
    }

    /// Whether a connection from `ip` may be accepted
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        self.with_state(|state| !state.enabled || state.allowed.contains(ip))
    }

    /// Whether the filter is active
    pub fn is_enabled(&self) -> bool {
        self.with_state(|state| state.enabled)
    }

    /// Current allow-list (empty while disabled)
    pub fn accepted_ips(&self) -> Vec<IpAddr> {
        self.with_state(|state| state.allowed.iter().copied().collect())
    }

    fn with_state<T>(&self, f: impl FnOnce(&FilterState) -> T) -> T {
        match self.state.read() {
            Ok(state) => f(&*state),
            Err(poisoned) => f(&*poisoned.into_inner()),
        }
    }
}
