//! Link-state advertisement message structures.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Default cost of a link
pub const DEFAULT_LINK_WEIGHT: u32 = 1;

/// Directed link between two nodes, backed by one physical channel.
///
/// `connection_id` disambiguates parallel links between the same pair. Equality, hashing and
/// ordering only consider `(source, destination, connection_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    /// Origin of the link
    pub source: NodeId,
    /// Target of the link
    pub destination: NodeId,
    /// Id of the channel backing this link
    pub connection_id: String,
    /// Path cost
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Reliability score carried along with the link; 0 unless a peer announces otherwise
    #[serde(default)]
    pub reliability: i32,
}

fn default_weight() -> u32 {
    DEFAULT_LINK_WEIGHT
}

impl Link {
    /// Create a link with default weight and reliability
    pub fn new(source: NodeId, destination: NodeId, connection_id: impl Into<String>) -> Self {
        Self {
            source,
            destination,
            connection_id: connection_id.into(),
            weight: DEFAULT_LINK_WEIGHT,
            reliability: 0,
        }
    }

    /// Set the path cost
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    fn key(&self) -> (&NodeId, &NodeId, &str) {
        (&self.source, &self.destination, &self.connection_id)
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Link {}

impl Hash for Link {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Link {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Link {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} [{}]",
            self.source, self.destination, self.connection_id
        )
    }
}

/// Why an LSA was generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LsaReason {
    /// Initial snapshot, e.g. part of a batch sent to a new neighbour
    Startup,
    /// The owner's outgoing links changed
    Update,
    /// The owner is leaving the network
    Shutdown,
}

/// Full replacement announcement of one node's outgoing links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStateAdvertisement {
    /// Node that owns every link in `links`
    pub owner: NodeId,
    /// Display name of the owner
    pub owner_display_name: String,
    /// Owner's version counter
    pub sequence_number: u64,
    /// Whether the owner forwards requests
    pub is_relay: bool,
    /// Graph hash of the sender's topology map when this LSA was produced
    pub graph_hash: u32,
    /// Why this LSA exists
    pub reason: LsaReason,
    /// Outgoing links of the owner
    pub links: Vec<Link>,
}

impl LinkStateAdvertisement {
    /// Whether this LSA announces that the owner is leaving
    pub fn is_shutdown(&self) -> bool {
        self.reason == LsaReason::Shutdown
    }
}

impl fmt::Display for LinkStateAdvertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LSA {:?} from {} seq={} links={}",
            self.reason,
            self.owner,
            self.sequence_number,
            self.links.len()
        )
    }
}

/// Snapshot LSAs of every node a map knows about, keyed by owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsaBatch(pub BTreeMap<NodeId, LinkStateAdvertisement>);

impl LsaBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an LSA, replacing one with the same owner
    pub fn insert(&mut self, lsa: LinkStateAdvertisement) {
        self.0.insert(lsa.owner.clone(), lsa);
    }

    /// Number of LSAs in the batch
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the batch holds no LSA
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the contained LSAs in owner order
    pub fn iter(&self) -> impl Iterator<Item = &LinkStateAdvertisement> {
        self.0.values()
    }
}

impl IntoIterator for LsaBatch {
    type Item = LinkStateAdvertisement;
    type IntoIter = std::collections::btree_map::IntoValues<NodeId, LinkStateAdvertisement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

/// Content of an `lsa` request or response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LsaPayload {
    /// One flooded LSA
    Single(LinkStateAdvertisement),
    /// Full topology exchange with a new neighbour
    Batch(LsaBatch),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn test_link_identity_ignores_weight() {
        let a = Link::new(id("1"), id("2"), "c1");
        let b = Link::new(id("1"), id("2"), "c1").with_weight(7);
        let c = Link::new(id("1"), id("2"), "c2");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Link> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_link_defaults_when_missing_from_payload() {
        let json = r#"{"source":"1","destination":"2","connection_id":"c"}"#;
        let link: Link = serde_json::from_str(json).unwrap();
        assert_eq!(link.weight, DEFAULT_LINK_WEIGHT);
        assert_eq!(link.reliability, 0);
    }

    #[test]
    fn test_batch_keeps_one_lsa_per_owner() {
        let lsa = |seq| LinkStateAdvertisement {
            owner: id("a"),
            owner_display_name: "A".into(),
            sequence_number: seq,
            is_relay: false,
            graph_hash: 0,
            reason: LsaReason::Startup,
            links: vec![],
        };

        let mut batch = LsaBatch::new();
        batch.insert(lsa(1));
        batch.insert(lsa(2));

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.iter().next().unwrap().sequence_number, 2);
    }
}
