//! Node and link operations of the topology map.

use super::{TopologyMap, TopologyNode};
use crate::TopologyError;
use mesh_wire::{Link, NodeId, NodeInfo};
use std::collections::BTreeSet;
use tracing::debug;

impl TopologyMap {
    /// Add a node if it is not present; returns whether it was added
    pub fn add_node(&mut self, node_id: &NodeId) -> bool {
        if self.nodes.contains_key(node_id) {
            return false;
        }
        self.nodes
            .insert(node_id.clone(), TopologyNode::discovered(node_id.clone()));
        true
    }

    /// Add a node or refresh its display name and relay flag
    pub fn add_or_update_node(&mut self, info: &NodeInfo) {
        let node = self
            .nodes
            .entry(info.node_id.clone())
            .or_insert_with(|| TopologyNode::discovered(info.node_id.clone()));
        node.display_name = info.display_name.clone();
        node.is_relay = info.is_relay;
    }

    /// Remove a node and every link where it is source or destination.
    ///
    /// Removing an absent node is a no-op. The local node cannot be removed.
    pub fn remove_node(&mut self, node_id: &NodeId) -> bool {
        if node_id == &self.local_node_id {
            debug!("Refusing to remove the local node {} from its own topology", node_id);
            return false;
        }
        if self.nodes.remove(node_id).is_none() {
            return false;
        }
        self.links
            .retain(|l| &l.source != node_id && &l.destination != node_id);
        true
    }

    /// Whether the node is known
    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Look up a node
    pub fn node(&self, node_id: &NodeId) -> Option<&TopologyNode> {
        self.nodes.get(node_id)
    }

    /// All known nodes, ordered by id
    pub fn nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values()
    }

    /// Number of known nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Add a link, creating missing endpoint nodes.
    ///
    /// Returns `false` without changes if an identical `(source, destination, connection_id)`
    /// link is already present.
    pub fn add_link(&mut self, link: Link) -> bool {
        if self.links.contains(&link) {
            return false;
        }
        self.add_node(&link.source);
        self.add_node(&link.destination);
        self.links.push(link);
        true
    }

    /// Convenience form of [`TopologyMap::add_link`] that reports duplicates as errors
    pub fn add_link_between(
        &mut self,
        source: &NodeId,
        destination: &NodeId,
        connection_id: &str,
    ) -> Result<Link, TopologyError> {
        if connection_id.is_empty() {
            return Err(TopologyError::MissingConnectionId(
                source.clone(),
                destination.clone(),
            ));
        }

        let link = Link::new(source.clone(), destination.clone(), connection_id);
        if !self.add_link(link.clone()) {
            return Err(TopologyError::LinkAlreadyExists {
                source_node: source.clone(),
                destination: destination.clone(),
                connection_id: connection_id.to_string(),
            });
        }
        Ok(link)
    }

    /// Remove a link; returns whether a matching link existed
    pub fn remove_link(&mut self, link: &Link) -> bool {
        match self.links.iter().position(|l| l == link) {
            Some(index) => {
                self.links.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove the link identified by its endpoints and connection id
    pub fn remove_link_between(
        &mut self,
        source: &NodeId,
        destination: &NodeId,
        connection_id: &str,
    ) -> bool {
        self.remove_link(&Link::new(
            source.clone(),
            destination.clone(),
            connection_id,
        ))
    }

    /// Whether the exact link is present
    pub fn contains_link(&self, source: &NodeId, destination: &NodeId, connection_id: &str) -> bool {
        self.links.iter().any(|l| {
            &l.source == source && &l.destination == destination && l.connection_id == connection_id
        })
    }

    /// Whether any link exists for the ordered pair
    pub fn contains_link_between(&self, source: &NodeId, destination: &NodeId) -> bool {
        self.links
            .iter()
            .any(|l| &l.source == source && &l.destination == destination)
    }

    /// All links for the ordered pair
    pub fn all_links_between(&self, source: &NodeId, destination: &NodeId) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|l| &l.source == source && &l.destination == destination)
            .collect()
    }

    /// All links in insertion order
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Number of links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Outgoing links of a node, in insertion order
    pub fn outgoing_links(&self, node_id: &NodeId) -> Vec<&Link> {
        self.links.iter().filter(|l| &l.source == node_id).collect()
    }

    /// Distinct destinations of the node's outgoing links
    pub fn successors(&self, node_id: &NodeId) -> BTreeSet<NodeId> {
        self.links
            .iter()
            .filter(|l| &l.source == node_id)
            .map(|l| l.destination.clone())
            .collect()
    }

    /// Distinct sources of the node's incoming links
    pub fn predecessors(&self, node_id: &NodeId) -> BTreeSet<NodeId> {
        self.links
            .iter()
            .filter(|l| &l.destination == node_id)
            .map(|l| l.source.clone())
            .collect()
    }

    /// The local node's outgoing link backed by the given channel
    pub fn link_for_connection(&self, connection_id: &str) -> Option<&Link> {
        self.links
            .iter()
            .find(|l| l.source == self.local_node_id && l.connection_id == connection_id)
    }

    /// Whether the local node has an outgoing link backed by the given channel
    pub fn has_link_for_connection(&self, connection_id: &str) -> bool {
        self.link_for_connection(connection_id).is_some()
    }

    /// Sequence number last accepted for a node
    pub fn sequence_number_of(&self, node_id: &NodeId) -> Result<u64, TopologyError> {
        self.nodes
            .get(node_id)
            .map(|n| n.sequence_number)
            .ok_or_else(|| TopologyError::UnknownNode(node_id.clone()))
    }

    /// CRC32 over the sorted node ids and sorted link keys.
    ///
    /// Two maps with equal node and link sets have equal hashes.
    pub fn graph_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for node_id in self.nodes.keys() {
            hasher.update(node_id.as_str().as_bytes());
            hasher.update(&[0]);
        }
        let mut links: Vec<&Link> = self.links.iter().collect();
        links.sort();
        for link in links {
            hasher.update(link.source.as_str().as_bytes());
            hasher.update(&[1]);
            hasher.update(link.destination.as_str().as_bytes());
            hasher.update(&[1]);
            hasher.update(link.connection_id.as_bytes());
            hasher.update(&[2]);
        }
        hasher.finalize()
    }

    /// Whether every known node last reported the same graph hash as this map has now
    pub fn has_same_topology_hashes_for_all_nodes(&self) -> bool {
        let hash = self.graph_hash();
        self.nodes
            .values()
            .all(|n| n.last_graph_hash == Some(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn map(local: &str) -> TopologyMap {
        TopologyMap::new(&NodeInfo::new(id(local), local, false))
    }

    #[test]
    fn test_three_node_scenario() {
        let mut topology = map("1");
        topology.add_link_between(&id("1"), &id("2"), "#1").unwrap();
        topology.add_link_between(&id("2"), &id("1"), "#1").unwrap();
        topology.add_link_between(&id("2"), &id("3"), "#1").unwrap();

        assert_eq!(topology.links().len(), 3);
        assert_eq!(topology.node_count(), 3);

        assert!(topology.remove_link_between(&id("1"), &id("2"), "#1"));
        assert!(!topology.contains_link_between(&id("1"), &id("2")));
        assert!(topology.contains_link_between(&id("2"), &id("1")));
        assert!(topology.contains_link_between(&id("2"), &id("3")));
    }

    #[test]
    fn test_duplicate_links_suppressed() {
        let mut topology = map("a");
        let link = Link::new(id("a"), id("b"), "c1");

        assert!(topology.add_link(link.clone()));
        assert!(!topology.add_link(link.clone().with_weight(5)));
        assert_eq!(topology.link_count(), 1);

        let err = topology
            .add_link_between(&id("a"), &id("b"), "c1")
            .unwrap_err();
        assert!(matches!(err, TopologyError::LinkAlreadyExists { .. }));

        // parallel link over another connection is fine
        assert!(topology.add_link(Link::new(id("a"), id("b"), "c2")));
        assert_eq!(topology.all_links_between(&id("a"), &id("b")).len(), 2);
        assert_eq!(topology.successors(&id("a")).len(), 1);

        assert!(matches!(
            topology.add_link_between(&id("a"), &id("b"), ""),
            Err(TopologyError::MissingConnectionId(..))
        ));
    }

    #[test]
    fn test_link_count_tracks_distinct_triples() {
        let mut topology = map("a");
        let ops: &[(bool, &str, &str, &str)] = &[
            (true, "a", "b", "1"),
            (true, "a", "b", "1"),
            (true, "b", "a", "1"),
            (false, "a", "b", "2"),
            (true, "a", "c", "1"),
            (false, "a", "b", "1"),
            (false, "a", "b", "1"),
            (true, "a", "b", "1"),
        ];

        let mut expected = BTreeSet::new();
        for &(add, s, d, c) in ops {
            let link = Link::new(id(s), id(d), c);
            if add {
                topology.add_link(link.clone());
                expected.insert(link);
            } else {
                assert_eq!(topology.remove_link(&link), expected.remove(&link));
            }
            assert_eq!(topology.link_count(), expected.len());
        }
    }

    #[test]
    fn test_remove_node_removes_only_incident_links() {
        let mut topology = map("a");
        topology.add_link(Link::new(id("a"), id("b"), "1"));
        topology.add_link(Link::new(id("b"), id("c"), "2"));
        topology.add_link(Link::new(id("c"), id("a"), "3"));
        topology.add_link(Link::new(id("c"), id("d"), "4"));

        assert!(topology.remove_node(&id("b")));
        assert!(!topology.remove_node(&id("b")));

        assert!(!topology.contains_node(&id("b")));
        assert_eq!(topology.link_count(), 2);
        assert!(topology.contains_link(&id("c"), &id("a"), "3"));
        assert!(topology.contains_link(&id("c"), &id("d"), "4"));

        assert!(!topology.remove_node(&id("a")));
        assert!(topology.contains_node(&id("a")));
    }

    #[test]
    fn test_successors_and_predecessors() {
        let mut topology = map("a");
        topology.add_link(Link::new(id("a"), id("b"), "1"));
        topology.add_link(Link::new(id("a"), id("c"), "2"));
        topology.add_link(Link::new(id("c"), id("b"), "3"));

        assert_eq!(
            topology.successors(&id("a")).into_iter().collect::<Vec<_>>(),
            vec![id("b"), id("c")]
        );
        assert_eq!(
            topology.predecessors(&id("b")).into_iter().collect::<Vec<_>>(),
            vec![id("a"), id("c")]
        );
        assert_eq!(topology.outgoing_links(&id("a")).len(), 2);
    }

    #[test]
    fn test_link_for_connection_is_local_only() {
        let mut topology = map("a");
        topology.add_link(Link::new(id("a"), id("b"), "ch-1"));
        topology.add_link(Link::new(id("b"), id("a"), "ch-2"));

        assert_eq!(
            topology.link_for_connection("ch-1").map(|l| &l.destination),
            Some(&id("b"))
        );
        assert!(!topology.has_link_for_connection("ch-2"));
    }

    #[test]
    fn test_graph_hash_is_order_independent() {
        let mut first = map("a");
        first.add_link(Link::new(id("a"), id("b"), "1"));
        first.add_link(Link::new(id("b"), id("a"), "1"));

        let mut second = map("b");
        second.add_link(Link::new(id("b"), id("a"), "1"));
        second.add_link(Link::new(id("a"), id("b"), "1"));

        assert_eq!(first, second);
        assert_eq!(first.graph_hash(), second.graph_hash());

        second.add_link(Link::new(id("b"), id("a"), "2"));
        assert_ne!(first.graph_hash(), second.graph_hash());
        assert_ne!(first, second);
    }

    #[test]
    fn test_sequence_number_of_unknown_node() {
        let topology = map("a");
        assert_eq!(topology.sequence_number_of(&id("a")), Ok(0));
        assert_eq!(
            topology.sequence_number_of(&id("zz")),
            Err(TopologyError::UnknownNode(id("zz")))
        );
    }
}
