//! Transport-qualified network addresses.

use crate::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where and how to reach a node, written as `transport:host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactPoint {
    /// Id of the transport provider that handles this address
    pub transport_id: String,
    /// Host name, IP address, or virtual endpoint name
    pub host: String,
    /// Port number
    pub port: u16,
}

impl ContactPoint {
    /// Create a contact point
    pub fn new(transport_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport_id: transport_id.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` part, as accepted by socket address resolution
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.transport_id, self.host, self.port)
    }
}

impl FromStr for ContactPoint {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WireError::ContactPoint(s.to_string());

        let (transport_id, rest) = s.trim().split_once(':').ok_or_else(invalid)?;
        // rsplit so that bracketed IPv6 hosts keep their colons
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if transport_id.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(transport_id, host, port))
    }
}
