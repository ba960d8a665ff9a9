//! Interfaces between transports, the channel service and the routing layer.

use crate::{ChannelError, MessageChannel};
use async_trait::async_trait;
use mesh_wire::{NetworkRequest, NetworkResponse, NodeId, NodeInfo};
use std::sync::Arc;

/// What a transport calls into when the remote side does something
#[async_trait]
pub trait EndpointHandler: Send + Sync {
    /// Handshake: learn the remote identity, return the local one or refuse the connection
    fn exchange_node_information(&self, remote: &NodeInfo) -> Result<NodeInfo, ChannelError>;

    /// The remote side opened a duplex connection and the transport created the mirror channel
    async fn on_remote_initiated_channel_established(&self, channel: Arc<dyn MessageChannel>);

    /// The remote side closed the channel with this id
    fn on_inbound_channel_closing(&self, inbound_channel_id: &str);

    /// A request arrived from the neighbour `last_hop`; always produces a response
    async fn on_raw_request_received(
        &self,
        request: NetworkRequest,
        last_hop: NodeId,
    ) -> NetworkResponse;
}

/// Forwards requests whose final recipient is another node
#[async_trait]
pub trait ForwardingService: Send + Sync {
    /// Send the request one hop closer to its recipient and wait for the answer
    async fn forward(&self, request: NetworkRequest) -> NetworkResponse;
}
