//! Topology map and route computation for the overlay network.
//!
//! A [`TopologyMap`] is one node's view of the whole overlay: a directed multigraph of nodes
//! and links, merged from link-state advertisements sent by every other node. Each node is
//! authoritative for its own outgoing links and versions them with a sequence number.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format;
pub mod map;

pub use error::TopologyError;
pub use format::{format_graphviz, format_info};
pub use map::{NetworkRoute, TopologyMap, TopologyNode, TopologyStats};
