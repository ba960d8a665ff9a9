//! Node identity types shared by every layer of the overlay.

use crate::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque, comparable identifier of a network participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from its string form
    pub fn new(id: impl Into<String>) -> Result<Self, WireError> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(WireError::NodeId(id));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random node id (32 hex characters)
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// String form of the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = WireError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl FromStr for NodeId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identity information a node announces during the channel handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable node id
    pub node_id: NodeId,
    /// Human-readable name
    pub display_name: String,
    /// Whether this node forwards requests on behalf of others
    pub is_relay: bool,
}

impl NodeInfo {
    /// Create node information
    pub fn new(node_id: NodeId, display_name: impl Into<String>, is_relay: bool) -> Self {
        Self {
            node_id,
            display_name: display_name.into(),
            is_relay,
        }
    }

    /// Short description for log output, e.g. `"alpha" [3f2a...]`
    pub fn log_description(&self) -> String {
        format!("\"{}\" [{}]", self.display_name, self.node_id)
    }
}

// Identity is defined by the node id alone
impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for NodeInfo {}

impl std::hash::Hash for NodeInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_validation() {
        assert!(NodeId::new("node-1").is_ok());
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("has space").is_err());

        let parsed: NodeId = "abc".parse().unwrap();
        assert_eq!(parsed.as_str(), "abc");
        assert_eq!(parsed.to_string(), "abc");
    }

    #[test]
    fn test_decoded_ids_are_validated() {
        let valid = crate::encode_payload(&"node-1").unwrap();
        let decoded: NodeId = crate::decode_payload(&valid).unwrap();
        assert_eq!(decoded.as_str(), "node-1");

        let invalid = crate::encode_payload(&"has space").unwrap();
        assert!(crate::decode_payload::<NodeId>(&invalid).is_err());
        assert!(serde_json::from_str::<NodeId>("\"\"").is_err());
    }

    #[test]
    fn test_random_ids_differ() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_node_info_identity_by_id() {
        let id = NodeId::new("n1").unwrap();
        let a = NodeInfo::new(id.clone(), "first", false);
        let b = NodeInfo::new(id, "renamed", true);
        assert_eq!(a, b);
        assert_eq!(a.log_description(), "\"first\" [n1]");
    }
}
