//! Link-state protocol, routing and forwarding for the overlay.
//!
//! The [`LinkStateProtocolManager`] keeps the local topology map in sync with the channel
//! registry and with every other node's advertisements. The [`NetworkRoutingService`] uses
//! that map to send requests along shortest paths and to forward requests on relay nodes.
//! [`OverlayNode`] wires both onto a channel service.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod node;
pub mod protocol;
pub mod router;
pub mod service;

pub use node::{NodeError, OverlayNode, OverlayNodeSettings};
pub use protocol::{LinkStateProtocolManager, LsaStats};
pub use router::{DropReason, Router, RouterStats, RoutingDecision, MAX_HOP_COUNT};
pub use service::NetworkRoutingService;
