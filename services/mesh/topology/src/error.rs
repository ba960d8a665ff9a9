//! Topology error types.

use mesh_wire::NodeId;
use thiserror::Error;

/// Errors raised by topology map operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// A link with the same source, destination and connection id is already present
    #[error("link {source_node} -> {destination} [{connection_id}] already exists")]
    LinkAlreadyExists {
        /// Link source
        source_node: NodeId,
        /// Link destination
        destination: NodeId,
        /// Connection id
        connection_id: String,
    },

    /// The node is not part of the map
    #[error("node {0} is not part of the known topology")]
    UnknownNode(NodeId),

    /// The destination cannot be reached from the source
    #[error("no route from {from} to {to}")]
    NoRoute {
        /// Route origin
        from: NodeId,
        /// Route destination
        to: NodeId,
    },

    /// Links must name the connection backing them
    #[error("link {0} -> {1} has no connection id")]
    MissingConnectionId(NodeId, NodeId),
}
