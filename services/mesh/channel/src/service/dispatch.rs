use super::MessageChannelService;
use crate::callbacks::callback;
use crate::listener::TrafficListener;
use crate::{describe, ChannelError, MessageChannel};
use mesh_wire::{NetworkRequest, NetworkResponse, NodeId};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

impl MessageChannelService {
    /// Send a request over a channel and wait for its response.
    ///
    /// Never fails: errors and timeouts are turned into responses with the matching result code.
    /// A channel that turns out to be broken, or fails at the transport level, is unregistered in
    /// the background.
    pub async fn send_request(
        &self,
        request: NetworkRequest,
        channel: &Arc<dyn MessageChannel>,
    ) -> NetworkResponse {
        self.stats()
            .record_sent(&request.message_type, request.content_size());
        {
            let request = request.clone();
            let channel_id = channel.channel_id().to_string();
            self.traffic_listeners()
                .enqueue(callback(move |l: Arc<dyn TrafficListener>| {
                    l.on_request_sent(&request, &channel_id);
                    async {}
                }));
        }

        let request_timeout = self.config().request_timeout;
        match timeout(request_timeout, channel.send_raw_request(request.clone())).await {
            Ok(Ok(response)) => response,
            Ok(Err(ChannelError::Broken(channel_id, reason))) => {
                warn!(
                    "Request {} failed on broken channel {}: {}",
                    request.request_id, channel_id, reason
                );
                self.spawn_broken_channel_handling(channel.clone());
                NetworkResponse::channel_closed_or_broken(&request, &channel_id)
            }
            Ok(Err(ChannelError::Transport(reason))) => {
                warn!(
                    "Request {} failed on channel {}, treating it as broken: {}",
                    request.request_id,
                    describe(channel.as_ref()),
                    reason
                );
                self.spawn_broken_channel_handling(channel.clone());
                NetworkResponse::channel_closed_or_broken(&request, channel.channel_id())
            }
            Ok(Err(ChannelError::Closed(channel_id))) => {
                debug!(
                    "Request {} not sent, channel {} is closed",
                    request.request_id, channel_id
                );
                NetworkResponse::channel_closed_or_broken(&request, &channel_id)
            }
            Ok(Err(e)) => {
                warn!(
                    "Request {} failed on channel {}: {}",
                    request.request_id,
                    describe(channel.as_ref()),
                    e
                );
                NetworkResponse::exception_while_forwarding(&request, e)
            }
            Err(_) => {
                warn!(
                    "Request {} on channel {} timed out after {:?}",
                    request.request_id,
                    describe(channel.as_ref()),
                    request_timeout
                );
                NetworkResponse::timeout(&request)
            }
        }
    }

    /// Send a request over the registered channel with this id
    pub async fn send_request_to_channel_id(
        &self,
        request: NetworkRequest,
        channel_id: &str,
    ) -> NetworkResponse {
        match self.outgoing_channel_by_id(channel_id).await {
            Some(channel) => self.send_request(request, &channel).await,
            None => {
                debug!(
                    "Request {} addressed to unknown channel {}",
                    request.request_id, channel_id
                );
                NetworkResponse::channel_closed_or_broken(&request, channel_id)
            }
        }
    }

    /// Handle a request whose final recipient is the local node
    pub async fn on_request_arrived_at_destination(
        &self,
        request: &NetworkRequest,
        last_hop: &NodeId,
    ) -> NetworkResponse {
        self.stats().record_delivered(&request.message_type);
        self.handlers()
            .dispatch(request, last_hop)
            .await
            .from_sender(self.local_node_info().node_id.clone())
    }

    /// Entry point for every request received from a neighbour
    pub async fn handle_incoming_request(
        &self,
        request: NetworkRequest,
        last_hop: NodeId,
    ) -> NetworkResponse {
        self.stats()
            .record_received(&request.message_type, request.content_size());
        {
            let request = request.clone();
            let last_hop = last_hop.clone();
            self.traffic_listeners()
                .enqueue(callback(move |l: Arc<dyn TrafficListener>| {
                    l.on_raw_request_received(&request, &last_hop);
                    async {}
                }));
        }

        let local = &self.local_node_info().node_id;
        let response = if request.is_destined_for(local) {
            self.on_request_arrived_at_destination(&request, &last_hop)
                .await
        } else if !self.local_node_info().is_relay {
            debug!(
                "Dropping request {} for {:?}: this node does not relay",
                request.request_id, request.metadata.final_recipient
            );
            NetworkResponse::no_route_while_forwarding(&request, local)
        } else {
            match self.forwarding_service() {
                Some(forwarding) => {
                    self.stats().record_forwarded(&request.message_type);
                    forwarding.forward(request.clone()).await
                }
                None => {
                    warn!(
                        "No forwarding service set; cannot forward request {}",
                        request.request_id
                    );
                    NetworkResponse::no_route_while_forwarding(&request, local)
                }
            }
        };

        {
            let response = response.clone();
            self.traffic_listeners()
                .enqueue(callback(move |l: Arc<dyn TrafficListener>| {
                    l.on_raw_response_generated(&response, &request, &last_hop);
                    async {}
                }));
        }
        response
    }
}
