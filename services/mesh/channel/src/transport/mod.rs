//! Transport providers.
//!
//! A provider is registered under a unique transport id and creates channels for contact
//! points carrying that id.

pub mod tcp;
pub mod virtual_net;

use crate::{BrokenChannelListener, ChannelError, ConnectionFilter, EndpointHandler, MessageChannel};
use async_trait::async_trait;
use mesh_wire::{ContactPoint, NodeInfo};
use std::sync::Arc;

pub use tcp::{TcpTransportProvider, TCP_TRANSPORT_ID};
pub use virtual_net::{VirtualFault, VirtualNetwork, VirtualTransportProvider, VIRTUAL_TRANSPORT_ID};

/// Creates channels and accepts connections for one kind of contact point
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Id matched against [`ContactPoint::transport_id`]
    fn transport_id(&self) -> &str;

    /// Whether the transport can carry a mirror channel over the same connection
    fn supports_duplex(&self) -> bool {
        true
    }

    /// Connect and perform the node-information handshake.
    ///
    /// The returned channel is established. With `allow_duplex`, the remote side creates a
    /// mirror channel back to this node and reports it to its endpoint handler.
    async fn connect(
        &self,
        contact_point: &ContactPoint,
        local: &NodeInfo,
        allow_duplex: bool,
        endpoint: Arc<dyn EndpointHandler>,
        broken_listener: Arc<dyn BrokenChannelListener>,
    ) -> Result<Arc<dyn MessageChannel>, ChannelError>;

    /// Accept connections at the contact point; returns the contact point actually bound
    async fn start_server(
        &self,
        contact_point: &ContactPoint,
        endpoint: Arc<dyn EndpointHandler>,
        filter: Arc<ConnectionFilter>,
    ) -> Result<ContactPoint, ChannelError>;

    /// Stop accepting connections at the contact point
    async fn stop_server(&self, contact_point: &ContactPoint) -> Result<(), ChannelError>;
}
