//! Routing and forwarding of requests over the topology map.

use crate::router::{
    DropReason, Router, RouterCounters, RouterStats, RoutingDecision, MAX_HOP_COUNT,
};
use async_trait::async_trait;
use bytes::Bytes;
use mesh_channel::{ForwardingService, MessageChannelService};
use mesh_topology::TopologyMap;
use mesh_wire::{NetworkRequest, NetworkResponse, NodeId};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Picks next hops from the topology map and sends requests along them
pub struct NetworkRoutingService {
    local_node_id: NodeId,
    topology: Arc<RwLock<TopologyMap>>,
    channels: Weak<MessageChannelService>,
    forwarding_timeout: Duration,
    counters: RouterCounters,
}

impl NetworkRoutingService {
    /// Create a routing service for the channel service's node
    pub fn new(topology: Arc<RwLock<TopologyMap>>, channels: &Arc<MessageChannelService>) -> Self {
        Self {
            local_node_id: channels.local_node_info().node_id.clone(),
            topology,
            channels: Arc::downgrade(channels),
            forwarding_timeout: channels.config().forwarding_timeout,
            counters: RouterCounters::default(),
        }
    }

    async fn route_to(&self, destination: &NodeId) -> RoutingDecision {
        let topology = self.topology.read().await;
        match topology.shortest_path(&self.local_node_id, destination) {
            Ok(route) => match route.first_link() {
                Some(link) => RoutingDecision::Forward {
                    next_hop: link.destination.clone(),
                    channel_id: link.connection_id.clone(),
                },
                None => RoutingDecision::Local,
            },
            Err(e) => {
                debug!("No route from {}: {}", self.local_node_id, e);
                RoutingDecision::Drop(DropReason::NoRoute)
            }
        }
    }

    async fn decide_and_count(&self, request: &NetworkRequest) -> RoutingDecision {
        let decision = self.decide(request).await;
        self.counters.record(&decision);
        decision
    }

    /// Send a locally originated request to `receiver` along the current shortest path.
    ///
    /// Unreachable receivers yield a `NO_ROUTE_TO_DESTINATION_AT_SENDER` response.
    pub async fn perform_routed_request(
        &self,
        message_type: &str,
        content: Bytes,
        receiver: &NodeId,
    ) -> NetworkResponse {
        let request = NetworkRequest::new(
            message_type,
            content,
            Some(self.local_node_id.clone()),
            Some(receiver.clone()),
        );
        let Some(channels) = self.channels.upgrade() else {
            return NetworkResponse::no_route_at_sender(&request);
        };

        match self.decide_and_count(&request).await {
            RoutingDecision::Local => {
                channels
                    .on_request_arrived_at_destination(&request, &self.local_node_id)
                    .await
            }
            RoutingDecision::Forward {
                next_hop,
                channel_id,
            } => {
                debug!(
                    "Sending request {} for {} via {} (channel {})",
                    request.request_id, receiver, next_hop, channel_id
                );
                channels.send_request_to_channel_id(request, &channel_id).await
            }
            RoutingDecision::Drop(reason) => {
                debug!("Cannot send request to {}: {}", receiver, reason);
                NetworkResponse::no_route_at_sender(&request)
            }
        }
    }

    /// Serialize `payload` and send it as a routed request
    pub async fn perform_routed_request_with_payload<T: Serialize>(
        &self,
        message_type: &str,
        payload: &T,
        receiver: &NodeId,
    ) -> Result<NetworkResponse, mesh_wire::WireError> {
        let content = mesh_wire::encode_payload(payload)?;
        Ok(self
            .perform_routed_request(message_type, content, receiver)
            .await)
    }

    /// Forward a request one hop and wait for the response, bounded by the forwarding timeout
    pub async fn forward_and_await(&self, request: NetworkRequest) -> NetworkResponse {
        let Some(channels) = self.channels.upgrade() else {
            return NetworkResponse::no_route_while_forwarding(&request, &self.local_node_id);
        };

        match self.decide_and_count(&request).await {
            RoutingDecision::Local => {
                let last_hop = request
                    .metadata
                    .trace
                    .last()
                    .cloned()
                    .unwrap_or_else(|| self.local_node_id.clone());
                channels
                    .on_request_arrived_at_destination(&request, &last_hop)
                    .await
            }
            RoutingDecision::Forward {
                next_hop,
                channel_id,
            } => {
                let forwarded = request.forwarded_by(&self.local_node_id);
                debug!(
                    "Forwarding request {} to {} (hop {})",
                    request.request_id, next_hop, forwarded.metadata.hop_count
                );
                let send = channels.send_request_to_channel_id(forwarded, &channel_id);
                match timeout(self.forwarding_timeout, send).await {
                    Ok(response) => response,
                    Err(_) => {
                        self.counters.record_forwarding_timeout();
                        warn!(
                            "Forwarded request {} to {} timed out after {:?}",
                            request.request_id, next_hop, self.forwarding_timeout
                        );
                        let detail = format!(
                            "timeout after {:?} at {}",
                            self.forwarding_timeout, self.local_node_id
                        );
                        NetworkResponse::exception_while_forwarding(&request, detail)
                    }
                }
            }
            RoutingDecision::Drop(reason) => {
                debug!(
                    "Dropping request {} for {:?}: {}",
                    request.request_id, request.metadata.final_recipient, reason
                );
                NetworkResponse::no_route_while_forwarding(&request, &self.local_node_id)
            }
        }
    }
}

#[async_trait]
impl Router for NetworkRoutingService {
    async fn decide(&self, request: &NetworkRequest) -> RoutingDecision {
        let Some(destination) = request
            .metadata
            .final_recipient
            .as_ref()
            .filter(|r| **r != self.local_node_id)
        else {
            return RoutingDecision::Local;
        };
        if request.metadata.trace.contains(&self.local_node_id) {
            return RoutingDecision::Drop(DropReason::RoutingLoop);
        }
        if request.metadata.hop_count >= MAX_HOP_COUNT {
            return RoutingDecision::Drop(DropReason::HopLimitExceeded);
        }
        self.route_to(destination).await
    }

    fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    async fn is_reachable(&self, destination: &NodeId) -> bool {
        self.topology
            .read()
            .await
            .reachable_node_ids(false)
            .contains(destination)
    }

    fn stats(&self) -> RouterStats {
        self.counters.snapshot()
    }
}

#[async_trait]
impl ForwardingService for NetworkRoutingService {
    async fn forward(&self, request: NetworkRequest) -> NetworkResponse {
        self.forward_and_await(request).await
    }
}
