//! Line-oriented admin console.
//!
//! Reads one command per line and answers with plain text. Everything goes through the
//! public operations of the node, so the console can never bypass the registry or the
//! topology lock.

use crate::{component_info, component_warn};
use anyhow::Result;
use mesh_channel::{describe, TrafficCounters};
use mesh_routing::{LsaStats, OverlayNode, RouterStats};
use mesh_topology::{format_graphviz, format_info};
use mesh_wire::{ContactPoint, NodeId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const HELP: &str = "\
commands:
  channels                      list outgoing channels
  connect <transport:host:port> open a channel
  close <channel-id>            close an outgoing channel
  topology [info|graphviz]      print the topology map
  route <node-id>               shortest route to a node
  health                        health-check failures per channel
  filter [off|<ip> ...]         show or set the inbound IP allow-list
  stats                         protocol, routing and traffic counters
  quit                          shut the node down
";

/// Rendering of the `topology` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyView {
    Info,
    Graphviz,
}

/// How the `filter` command changes the allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterChange {
    Show,
    Disable,
    Allow(Vec<IpAddr>),
}

/// One parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Channels,
    Connect(ContactPoint),
    Close(String),
    Topology(TopologyView),
    Route(NodeId),
    Health,
    Filter(FilterChange),
    Stats,
    Help,
    Quit,
}

impl Command {
    /// Parse a line; `Ok(None)` for blank lines
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match (name, args.as_slice()) {
            ("channels", []) => Command::Channels,
            ("connect", [cp]) => Command::Connect(cp.parse().map_err(|e| format!("{}", e))?),
            ("close", [id]) => Command::Close(id.to_string()),
            ("topology", []) | ("topology", ["info"]) => Command::Topology(TopologyView::Info),
            ("topology", ["graphviz"]) => Command::Topology(TopologyView::Graphviz),
            ("route", [id]) => Command::Route(id.parse().map_err(|e| format!("{}", e))?),
            ("health", []) => Command::Health,
            ("filter", []) => Command::Filter(FilterChange::Show),
            ("filter", ["off"]) => Command::Filter(FilterChange::Disable),
            ("filter", ips) => Command::Filter(FilterChange::Allow(
                ips.iter()
                    .map(|ip| ip.parse().map_err(|_| format!("invalid IP address {:?}", ip)))
                    .collect::<Result<_, _>>()?,
            )),
            ("stats", []) => Command::Stats,
            ("help", _) | ("?", _) => Command::Help,
            ("quit", []) | ("exit", []) => Command::Quit,
            _ => return Err(format!("unknown command {:?}, try 'help'", line.trim())),
        };
        Ok(Some(command))
    }
}

/// Result of executing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Output(String),
    Quit,
}

#[derive(Serialize)]
struct StatsReport {
    lsa: LsaStats,
    routing: RouterStats,
    traffic: BTreeMap<String, TrafficCounters>,
}

/// Admin console bound to one node
pub struct AdminConsole {
    node: Arc<OverlayNode>,
    allow_duplex: bool,
}

impl AdminConsole {
    pub fn new(node: Arc<OverlayNode>, allow_duplex: bool) -> Self {
        Self { node, allow_duplex }
    }

    /// Serve commands until `quit` or end of input
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let reply = match Command::parse(&line) {
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => continue,
                Err(message) => Reply::Output(format!("{}\n", message)),
            };
            match reply {
                Reply::Output(text) => {
                    writer.write_all(text.as_bytes()).await?;
                    writer.flush().await?;
                }
                Reply::Quit => break,
            }
        }
        Ok(())
    }

    /// Execute one command
    pub async fn execute(&self, command: Command) -> Reply {
        let output = match command {
            Command::Channels => self.channels().await,
            Command::Connect(contact_point) => self.connect(contact_point).await,
            Command::Close(channel_id) => self.close(&channel_id).await,
            Command::Topology(view) => {
                let map = self.node.topology().read().await;
                match view {
                    TopologyView::Info => format_info(&map),
                    TopologyView::Graphviz => format_graphviz(&map),
                }
            }
            Command::Route(destination) => self.route(&destination).await,
            Command::Health => self.health().await,
            Command::Filter(change) => self.filter(change),
            Command::Stats => self.stats(),
            Command::Help => HELP.to_string(),
            Command::Quit => return Reply::Quit,
        };
        Reply::Output(output)
    }

    async fn channels(&self) -> String {
        let channels = self.node.channels().all_outgoing_channels().await;
        if channels.is_empty() {
            return "no outgoing channels\n".to_string();
        }
        let mut out = String::new();
        for channel in channels {
            let origin = if channel.core().initiated_by_remote() {
                "remote"
            } else {
                "local"
            };
            let _ = write!(out, "{} [{}]", describe(channel.as_ref()), origin);
            if let Some(mirror) = channel.core().associated_mirror_channel_id() {
                let _ = write!(out, " mirror of {}", mirror);
            }
            out.push('\n');
        }
        out
    }

    async fn connect(&self, contact_point: ContactPoint) -> String {
        match self.node.connect(contact_point.clone(), self.allow_duplex).await {
            Ok(channel) => {
                component_info!("console", "Connected to {}", contact_point);
                format!("connected: {}\n", describe(channel.as_ref()))
            }
            Err(e) => {
                component_warn!("console", "Connect to {} failed: {}", contact_point, e);
                format!("connect to {} failed: {}\n", contact_point, e)
            }
        }
    }

    async fn close(&self, channel_id: &str) -> String {
        let channels = self.node.channels();
        let Some(channel) = channels.outgoing_channel_by_id(channel_id).await else {
            return format!("unknown channel {}\n", channel_id);
        };
        if channels.close_outgoing_channel(&channel).await {
            component_info!("console", "Closed channel {}", channel_id);
            format!("closed {}\n", channel_id)
        } else {
            format!("channel {} was already closing\n", channel_id)
        }
    }

    async fn route(&self, destination: &NodeId) -> String {
        match self.node.route_to(destination).await {
            Ok(route) if route.is_empty() => format!("{} is the local node\n", destination),
            Ok(route) => {
                let mut out = route.source.to_string();
                for node in &route.nodes {
                    let _ = write!(out, " -> {}", node);
                }
                let via = route
                    .first_link()
                    .map(|link| link.connection_id.as_str())
                    .unwrap_or("-");
                let _ = writeln!(out, " ({} hops, via channel {})", route.len(), via);
                out
            }
            Err(e) => format!("{}\n", e),
        }
    }

    async fn health(&self) -> String {
        let channels = self.node.channels();
        let mut out = String::new();
        for channel in channels.all_outgoing_channels().await {
            let failures = channels
                .health_state(channel.channel_id())
                .map(|state| state.consecutive_failures())
                .unwrap_or(0);
            let _ = writeln!(
                out,
                "{} failures={}/{}",
                describe(channel.as_ref()),
                failures,
                channels.config().health_check_failure_limit
            );
        }
        if out.is_empty() {
            out.push_str("no outgoing channels\n");
        }
        out
    }

    fn filter(&self, change: FilterChange) -> String {
        let filter = self.node.channels().connection_filter();
        match change {
            FilterChange::Show => {}
            FilterChange::Disable => filter.configure(None),
            FilterChange::Allow(ips) => filter.configure(Some(ips)),
        }
        if !filter.is_enabled() {
            return "connection filter disabled, accepting every peer\n".to_string();
        }
        let ips: Vec<String> = filter
            .accepted_ips()
            .iter()
            .map(IpAddr::to_string)
            .collect();
        format!("accepting connections from: {}\n", ips.join(", "))
    }

    fn stats(&self) -> String {
        let report = StatsReport {
            lsa: self.node.lsa_stats(),
            routing: self.node.router_stats(),
            traffic: self.node.channels().traffic_stats(),
        };
        match serde_json::to_string_pretty(&report) {
            Ok(json) => format!("{}\n", json),
            Err(e) => format!("cannot render stats: {}\n", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_channel::transport::{
        VirtualNetwork, VirtualTransportProvider, VIRTUAL_TRANSPORT_ID,
    };
    use mesh_channel::CommunicationConfig;
    use mesh_routing::OverlayNodeSettings;
    use mesh_wire::NodeInfo;
    use std::time::Duration;

    async fn start_node(network: &Arc<VirtualNetwork>, name: &str) -> Arc<OverlayNode> {
        let info = NodeInfo::new(NodeId::new(name).unwrap(), name, true);
        let node = OverlayNode::new(info, CommunicationConfig::default()).await;
        node.add_transport_provider(Arc::new(VirtualTransportProvider::new(network.clone())))
            .unwrap();
        let settings = OverlayNodeSettings {
            servers: vec![ContactPoint::new(VIRTUAL_TRANSPORT_ID, name, 1)],
            allow_duplex: true,
            ..Default::default()
        };
        node.start(&settings).await.unwrap();
        node
    }

    async fn output(console: &AdminConsole, line: &str) -> String {
        match console.execute(Command::parse(line).unwrap().unwrap()).await {
            Reply::Output(text) => text,
            Reply::Quit => panic!("unexpected quit"),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("   "), Ok(None));
        assert_eq!(Command::parse("channels"), Ok(Some(Command::Channels)));
        assert_eq!(
            Command::parse("topology graphviz"),
            Ok(Some(Command::Topology(TopologyView::Graphviz)))
        );
        assert_eq!(
            Command::parse("connect tcp:10.0.0.1:21000"),
            Ok(Some(Command::Connect(ContactPoint::new("tcp", "10.0.0.1", 21000))))
        );
        assert_eq!(
            Command::parse("filter 10.0.0.1 10.0.0.2").unwrap(),
            Some(Command::Filter(FilterChange::Allow(vec![
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap()
            ])))
        );

        assert!(Command::parse("connect nowhere").is_err());
        assert!(Command::parse("filter 10.0.0.300").is_err());
        assert!(Command::parse("topology sideways").is_err());
        assert!(Command::parse("channels extra").is_err());
        assert!(Command::parse("launch").is_err());
    }

    #[tokio::test]
    async fn test_connect_route_and_close() {
        let network = VirtualNetwork::new();
        let a = start_node(&network, "a").await;
        let _b = start_node(&network, "b").await;
        let console = AdminConsole::new(a.clone(), true);

        assert_eq!(output(&console, "channels").await, "no outgoing channels\n");
        let connected = output(&console, "connect virtual:b:1").await;
        assert!(connected.starts_with("connected: "), "{}", connected);

        let mut route = String::new();
        for _ in 0..40 {
            route = output(&console, "route b").await;
            if route.starts_with("a -> b (1 hops") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(route.starts_with("a -> b (1 hops"), "{}", route);
        assert_eq!(output(&console, "route a").await, "a is the local node\n");

        let channel = a.channels().all_outgoing_channels().await.remove(0);
        let health = output(&console, "health").await;
        assert!(health.contains("failures=0/3"), "{}", health);

        let graph = output(&console, "topology graphviz").await;
        assert!(graph.starts_with("digraph topology {"));

        let closed = output(&console, &format!("close {}", channel.channel_id())).await;
        assert_eq!(closed, format!("closed {}\n", channel.channel_id()));
        assert_eq!(
            output(&console, "close missing").await,
            "unknown channel missing\n"
        );
        assert!(output(&console, "connect virtual:nobody:1")
            .await
            .contains("failed"));
    }

    #[tokio::test]
    async fn test_filter_and_stats() {
        let network = VirtualNetwork::new();
        let a = start_node(&network, "a").await;
        let console = AdminConsole::new(a.clone(), true);

        assert!(output(&console, "filter").await.contains("disabled"));
        assert_eq!(
            output(&console, "filter 127.0.0.1").await,
            "accepting connections from: 127.0.0.1\n"
        );
        assert!(a
            .channels()
            .connection_filter()
            .is_allowed(&"127.0.0.1".parse().unwrap()));
        assert!(output(&console, "filter off").await.contains("disabled"));

        let stats: serde_json::Value =
            serde_json::from_str(&output(&console, "stats").await).unwrap();
        assert!(stats["lsa"]["sent"].is_u64());
        assert!(stats["routing"]["decisions_made"].is_u64());
    }

    #[tokio::test]
    async fn test_run_stops_at_quit() {
        let network = VirtualNetwork::new();
        let a = start_node(&network, "a").await;
        let console = AdminConsole::new(a, true);

        let input: &[u8] = b"channels\n\nbogus\nquit\nchannels\n";
        let mut written = Vec::new();
        console.run(input, &mut written).await.unwrap();

        let text = String::from_utf8(written).unwrap();
        assert_eq!(text.matches("no outgoing channels").count(), 1);
        assert!(text.contains("unknown command \"bogus\""));
    }
}
