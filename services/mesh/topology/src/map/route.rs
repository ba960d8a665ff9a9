//! Shortest-path computation over the topology map.

use super::{NetworkRoute, TopologyMap};
use crate::TopologyError;
use mesh_wire::{Link, NodeId};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::time::Instant;
use tracing::debug;

impl TopologyMap {
    /// Compute the shortest path between two nodes using link weights as cost.
    ///
    /// Equal-cost alternatives are resolved in link insertion order. The returned node list
    /// excludes `source` and ends with `destination`.
    pub fn shortest_path(
        &self,
        source: &NodeId,
        destination: &NodeId,
    ) -> Result<NetworkRoute, TopologyError> {
        if !self.contains_node(source) {
            return Err(TopologyError::UnknownNode(source.clone()));
        }
        let no_route = || TopologyError::NoRoute {
            from: source.clone(),
            to: destination.clone(),
        };
        if !self.contains_node(destination) {
            return Err(no_route());
        }

        let start = Instant::now();
        let previous = self.dijkstra(source, Some(destination)).1;

        // walk back from the destination
        let mut path: Vec<Link> = Vec::new();
        let mut current = destination;
        while current != source {
            let link = previous.get(current).ok_or_else(no_route)?;
            path.push((*link).clone());
            current = &link.source;
        }
        path.reverse();

        let nodes = path.iter().map(|l| l.destination.clone()).collect();
        let computation_time = start.elapsed();
        debug!(
            "Computed route {} -> {} ({} hops) in {:?}",
            source,
            destination,
            path.len(),
            computation_time
        );

        Ok(NetworkRoute {
            source: source.clone(),
            destination: destination.clone(),
            path,
            nodes,
            computation_time,
        })
    }

    /// Ids of all nodes reachable from the local node, including itself.
    ///
    /// With `restrict_to_relays_and_self`, only relay nodes and the local node are returned.
    pub fn reachable_node_ids(&self, restrict_to_relays_and_self: bool) -> BTreeSet<NodeId> {
        let distances = self.dijkstra(&self.local_node_id, None).0;
        distances
            .into_keys()
            .filter(|node_id| {
                !restrict_to_relays_and_self
                    || *node_id == &self.local_node_id
                    || self.node(node_id).map(|n| n.is_relay).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Dijkstra from `source`; stops early once `target` is settled.
    ///
    /// Returns the settled distances and the link used to reach each node.
    fn dijkstra<'a>(
        &'a self,
        source: &'a NodeId,
        target: Option<&NodeId>,
    ) -> (HashMap<&'a NodeId, u64>, HashMap<&'a NodeId, &'a Link>) {
        let mut distances: HashMap<&NodeId, u64> = HashMap::new();
        let mut previous: HashMap<&NodeId, &Link> = HashMap::new();
        let mut settled: BTreeSet<&NodeId> = BTreeSet::new();
        // (cost, push order, node): the counter keeps equal-cost pops in FIFO order
        let mut queue: BinaryHeap<Reverse<(u64, u64, &NodeId)>> = BinaryHeap::new();
        let mut pushes = 0u64;

        distances.insert(source, 0);
        queue.push(Reverse((0, pushes, source)));

        while let Some(Reverse((current_dist, _, current))) = queue.pop() {
            if !settled.insert(current) {
                continue;
            }
            if Some(current) == target {
                break;
            }

            for link in self.links.iter().filter(|l| &l.source == current) {
                let new_dist = current_dist.saturating_add(u64::from(link.weight));
                let better = distances
                    .get(&link.destination)
                    .map_or(true, |&existing| new_dist < existing);
                if better && !settled.contains(&link.destination) {
                    distances.insert(&link.destination, new_dist);
                    previous.insert(&link.destination, link);
                    pushes += 1;
                    queue.push(Reverse((new_dist, pushes, &link.destination)));
                }
            }
        }

        distances.retain(|node, _| settled.contains(node));
        (distances, previous)
    }
}
