//! Configuration handling for the node binary.
//!
//! Values come from a YAML file, then `FLOW_MESH_*` environment variables, then command
//! line flags, each layer overriding the previous one.

use anyhow::{bail, Context, Result};
use mesh_channel::CommunicationConfig;
use mesh_routing::OverlayNodeSettings;
use mesh_wire::{ContactPoint, NodeId, NodeInfo};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

/// Prefix of all environment overrides
const ENV_PREFIX: &str = "FLOW_MESH_";

/// Node binary configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Identity of this node
    pub node: NodeConfig,
    /// Servers, initial connections and channel options
    pub network: NetworkConfig,
    /// Timeouts and health-check tunables
    pub communication: CommunicationConfig,
    /// IP allow-list for inbound connections
    pub filter: FilterConfig,
}

/// Identity section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id; a random one is generated when absent
    pub node_id: Option<String>,
    /// Human readable name; defaults to the node id
    pub display_name: Option<String>,
    /// Whether this node forwards requests for others
    pub relay: bool,
}

/// Network section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Contact points to accept connections at, as `transport:host:port`
    pub listen: Vec<String>,
    /// Contact points to connect to on startup
    pub connect: Vec<String>,
    /// Let peers open mirror channels back over our connections
    pub allow_duplex: bool,
    /// Run the periodic health-check loop
    pub health_checks: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: vec!["tcp:0.0.0.0:21000".to_string()],
            connect: Vec::new(),
            allow_duplex: true,
            health_checks: true,
        }
    }
}

/// Connection filter section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Whether the allow-list is enforced
    pub enabled: bool,
    /// Accepted peer addresses
    pub allowed_ips: Vec<IpAddr>,
}

impl MeshConfig {
    /// Load the file if it exists, then apply environment overrides.
    ///
    /// A missing file yields the defaults; a file that does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: MeshConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("invalid configuration file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("cannot read configuration file {:?}", path));
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply `FLOW_MESH_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(node_id) = var("NODE_ID") {
            info!("Node id overridden by environment: {}", node_id);
            self.node.node_id = Some(node_id);
        }
        if let Some(display_name) = var("DISPLAY_NAME") {
            self.node.display_name = Some(display_name);
        }
        if let Some(relay) = var("RELAY") {
            self.node.relay = parse_bool(&relay)
                .with_context(|| format!("{}RELAY must be true or false", ENV_PREFIX))?;
        }
        if let Some(listen) = var("LISTEN") {
            self.network.listen = listen
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            info!("Listen addresses overridden by environment: {:?}", self.network.listen);
        }
        Ok(())
    }

    /// Identity of the node, generating a random id when none is configured
    pub fn node_info(&self) -> Result<NodeInfo> {
        let node_id = match &self.node.node_id {
            Some(id) => NodeId::new(id.as_str())
                .with_context(|| format!("invalid node id {:?}", id))?,
            None => NodeId::random(),
        };
        let display_name = self
            .node
            .display_name
            .clone()
            .unwrap_or_else(|| node_id.to_string());
        Ok(NodeInfo::new(node_id, display_name, self.node.relay))
    }

    /// Startup settings with all contact points parsed
    pub fn node_settings(&self) -> Result<OverlayNodeSettings> {
        if self.communication.forwarding_timeout >= self.communication.request_timeout {
            bail!(
                "forwarding_timeout ({:?}) must be shorter than request_timeout ({:?})",
                self.communication.forwarding_timeout,
                self.communication.request_timeout
            );
        }
        Ok(OverlayNodeSettings {
            servers: parse_contact_points(&self.network.listen)?,
            connections: parse_contact_points(&self.network.connect)?,
            allow_duplex: self.network.allow_duplex,
            allowed_ips: self
                .filter
                .enabled
                .then(|| self.filter.allowed_ips.clone()),
            health_checks: self.network.health_checks,
        })
    }
}

fn parse_contact_points(values: &[String]) -> Result<Vec<ContactPoint>> {
    values
        .iter()
        .map(|value| {
            value
                .parse::<ContactPoint>()
                .with_context(|| format!("invalid contact point {:?}", value))
        })
        .collect()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("not a boolean: {:?}", other),
    }
}
