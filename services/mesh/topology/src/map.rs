//! Topology map: this node's belief about the whole overlay graph.

use mesh_wire::{Link, NodeId, NodeInfo};
use std::collections::BTreeMap;
use std::time::Duration;

/// A node as known to the topology map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNode {
    /// Node id
    pub node_id: NodeId,
    /// Display name; empty until the node announced itself
    pub display_name: String,
    /// Whether the node forwards requests
    pub is_relay: bool,
    /// Last accepted sequence number (0 if no LSA was accepted yet)
    pub sequence_number: u64,
    /// Graph hash the node reported with its last LSA
    pub last_graph_hash: Option<u32>,
}

impl TopologyNode {
    pub(crate) fn discovered(node_id: NodeId) -> Self {
        Self {
            node_id,
            display_name: String::new(),
            is_relay: false,
            sequence_number: 0,
            last_graph_hash: None,
        }
    }

    /// Display name, falling back to the id
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            self.node_id.as_str()
        } else {
            &self.display_name
        }
    }
}

/// Result of a shortest-path computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRoute {
    /// Route origin
    pub source: NodeId,
    /// Route target
    pub destination: NodeId,
    /// Links traversed, in order
    pub path: Vec<Link>,
    /// Nodes visited after `source`, ending with `destination`
    pub nodes: Vec<NodeId>,
    /// Time spent computing the route
    pub computation_time: Duration,
}

impl NetworkRoute {
    /// Number of hops
    pub fn len(&self) -> usize {
        self.path.len()
    }

    /// Whether source and destination are the same node
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// First link of the route; its connection id names the outgoing channel to use
    pub fn first_link(&self) -> Option<&Link> {
        self.path.first()
    }

    /// Next node on the route
    pub fn next_hop(&self) -> Option<&NodeId> {
        self.nodes.first()
    }
}

/// Topology map statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyStats {
    /// Total number of known nodes
    pub total_nodes: usize,
    /// Total number of known links
    pub total_links: usize,
    /// Current local sequence number
    pub local_sequence: u64,
    /// Whether every node reported the same graph hash as ours
    pub converged: bool,
}

/// Directed multigraph of nodes and links, owned by one local node.
///
/// Links are kept in insertion order, which is also the tie-break order of route computation.
/// The map does no locking of its own; hosts share it behind a single lock.
#[derive(Debug, Clone)]
pub struct TopologyMap {
    local_node_id: NodeId,
    nodes: BTreeMap<NodeId, TopologyNode>,
    links: Vec<Link>,
}

impl TopologyMap {
    /// Create a map containing only the local node
    pub fn new(local: &NodeInfo) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            local.node_id.clone(),
            TopologyNode {
                node_id: local.node_id.clone(),
                display_name: local.display_name.clone(),
                is_relay: local.is_relay,
                sequence_number: 0,
                last_graph_hash: None,
            },
        );

        Self {
            local_node_id: local.node_id.clone(),
            nodes,
            links: Vec::new(),
        }
    }

    /// Id of the node owning this map
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// Topology statistics
    pub fn stats(&self) -> TopologyStats {
        TopologyStats {
            total_nodes: self.nodes.len(),
            total_links: self.links.len(),
            local_sequence: self.local_sequence(),
            converged: self.has_same_topology_hashes_for_all_nodes(),
        }
    }

    fn local_sequence(&self) -> u64 {
        self.nodes
            .get(&self.local_node_id)
            .map(|n| n.sequence_number)
            .unwrap_or_default()
    }
}

// Structural equality: same node ids and same links, sequence numbers ignored
impl PartialEq for TopologyMap {
    fn eq(&self, other: &Self) -> bool {
        if !self.nodes.keys().eq(other.nodes.keys()) || self.links.len() != other.links.len() {
            return false;
        }
        let mut ours: Vec<&Link> = self.links.iter().collect();
        let mut theirs: Vec<&Link> = other.links.iter().collect();
        ours.sort();
        theirs.sort();
        ours == theirs
    }
}

impl Eq for TopologyMap {}

// Include implementation
mod graph;
mod lsa;
mod route;
