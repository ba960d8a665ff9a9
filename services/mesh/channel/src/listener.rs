//! Listener interfaces notified by the channel service.

use crate::MessageChannel;
use async_trait::async_trait;
use mesh_wire::{NetworkRequest, NetworkResponse, NodeId};
use std::sync::Arc;

/// Observes the set of outgoing channels.
///
/// Callbacks for one listener are delivered in order on a dedicated task.
#[async_trait]
pub trait ChannelLifecycleListener: Send + Sync {
    /// Snapshot of all channels at the time the listener was registered; always the first callback
    async fn set_initial_message_channels(&self, _channels: Vec<Arc<dyn MessageChannel>>) {}

    /// A new outgoing channel was registered
    async fn on_outgoing_channel_established(&self, _channel: Arc<dyn MessageChannel>) {}

    /// An outgoing channel was closed or marked broken and unregistered
    async fn on_outgoing_channel_terminated(&self, _channel: Arc<dyn MessageChannel>) {}
}

/// Observes request traffic, e.g. for statistics or diagnostics
pub trait TrafficListener: Send + Sync {
    /// A request is about to be sent over an outgoing channel
    fn on_request_sent(&self, _request: &NetworkRequest, _channel_id: &str) {}

    /// A request arrived from a neighbour
    fn on_raw_request_received(&self, _request: &NetworkRequest, _last_hop: &NodeId) {}

    /// A response to an incoming request was produced
    fn on_raw_response_generated(
        &self,
        _response: &NetworkResponse,
        _request: &NetworkRequest,
        _last_hop: &NodeId,
    ) {
    }
}
