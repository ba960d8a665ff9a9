//! LSA merge and generation.

use super::TopologyMap;
use mesh_wire::{Link, LinkStateAdvertisement, LsaBatch, LsaReason, NodeId};
use tracing::{debug, info, warn};

impl TopologyMap {
    /// Merge an LSA into the map.
    ///
    /// Returns `true` if the LSA was accepted, `false` if it was stale or otherwise ignored.
    /// Acceptance does not imply that the graph changed.
    pub fn update(&mut self, lsa: &LinkStateAdvertisement) -> bool {
        if lsa.owner == self.local_node_id {
            return false;
        }

        let known_sequence = self.nodes.get(&lsa.owner).map(|n| n.sequence_number);
        match known_sequence {
            Some(sequence) if sequence >= lsa.sequence_number => {
                debug!(
                    "Ignoring stale LSA from {} (seq: {} vs {})",
                    lsa.owner, lsa.sequence_number, sequence
                );
                return false;
            }
            None if lsa.is_shutdown() => {
                debug!("Ignoring shutdown LSA from unknown node {}", lsa.owner);
                return false;
            }
            _ => {}
        }

        // full replacement of the owner's outgoing links
        if known_sequence.is_some() {
            let owner = &lsa.owner;
            self.links.retain(|l| &l.source != owner);
        }

        match lsa.reason {
            LsaReason::Startup | LsaReason::Update => {
                self.add_node(&lsa.owner);
                if let Some(node) = self.nodes.get_mut(&lsa.owner) {
                    node.display_name = lsa.owner_display_name.clone();
                    node.is_relay = lsa.is_relay;
                    node.sequence_number = lsa.sequence_number;
                    node.last_graph_hash = Some(lsa.graph_hash);
                }

                for link in &lsa.links {
                    if link.source != lsa.owner {
                        warn!(
                            "Dropping link {} from LSA of {}: not owned by the sender",
                            link, lsa.owner
                        );
                        continue;
                    }
                    self.add_link(link.clone());
                }
            }
            LsaReason::Shutdown => {
                info!(
                    "Received a shutdown notice for node {}; removing it from local topology",
                    lsa.owner
                );
                self.remove_node(&lsa.owner);
            }
        }

        true
    }

    /// Increment the local sequence number and snapshot the local node's outgoing links.
    ///
    /// This is the only way the local sequence number advances (apart from shutdown).
    pub fn generate_new_local_lsa(&mut self) -> LinkStateAdvertisement {
        let local = self.local_node_id.clone();
        self.generate_lsa(&local, true, LsaReason::Update)
    }

    /// Snapshot LSAs for the local node and every node with announced state, without
    /// incrementing anything. Nodes known only as link targets have nothing to announce.
    pub fn generate_lsa_batch_of_all_nodes(&mut self) -> LsaBatch {
        let owners: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.node_id == self.local_node_id || n.sequence_number > 0)
            .map(|n| n.node_id.clone())
            .collect();

        let mut batch = LsaBatch::new();
        for owner in owners {
            batch.insert(self.generate_lsa(&owner, false, LsaReason::Startup));
        }
        batch
    }

    /// Increment the local sequence number and announce that this node is leaving
    pub fn generate_shutdown_lsa(&mut self) -> LinkStateAdvertisement {
        let local = self.local_node_id.clone();
        self.generate_lsa(&local, true, LsaReason::Shutdown)
    }

    fn generate_lsa(
        &mut self,
        owner: &NodeId,
        increment: bool,
        reason: LsaReason,
    ) -> LinkStateAdvertisement {
        let hash = self.graph_hash();
        let is_local = owner == &self.local_node_id;
        let links: Vec<Link> = if reason == LsaReason::Shutdown {
            Vec::new()
        } else {
            self.outgoing_links(owner).into_iter().cloned().collect()
        };

        let node = self
            .nodes
            .entry(owner.clone())
            .or_insert_with(|| super::TopologyNode::discovered(owner.clone()));

        if is_local {
            node.last_graph_hash = Some(hash);
        }
        if increment {
            node.sequence_number += 1;
        }

        LinkStateAdvertisement {
            owner: owner.clone(),
            owner_display_name: node.display_name.clone(),
            sequence_number: node.sequence_number,
            is_relay: node.is_relay,
            graph_hash: node.last_graph_hash.unwrap_or(hash),
            reason,
            links,
        }
    }
}
