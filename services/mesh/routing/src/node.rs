//! Assembly of one overlay node: topology map, channel service, link-state protocol and
//! routing, wired together and started from a contact-point configuration.

use crate::protocol::{LinkStateProtocolManager, LsaStats};
use crate::router::{Router, RouterStats};
use crate::service::NetworkRoutingService;
use bytes::Bytes;
use mesh_channel::transport::TransportProvider;
use mesh_channel::{
    ChannelError, CommunicationConfig, ForwardingService, MessageChannel, MessageChannelService,
};
use mesh_topology::{NetworkRoute, TopologyError, TopologyMap};
use mesh_wire::{ContactPoint, NetworkResponse, NodeId, NodeInfo, MESSAGE_TYPE_LSA};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Errors raised while starting or operating a node
#[derive(Error, Debug)]
pub enum NodeError {
    /// Channel layer failure
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A background task failed
    #[error("task failed: {0}")]
    Task(String),
}

/// Startup settings of an overlay node
#[derive(Debug, Clone, Default)]
pub struct OverlayNodeSettings {
    /// Contact points to accept connections at
    pub servers: Vec<ContactPoint>,
    /// Contact points to connect to on startup
    pub connections: Vec<ContactPoint>,
    /// Let connected peers open mirror channels back to this node
    pub allow_duplex: bool,
    /// IP allow-list for inbound connections; `None` accepts everyone
    pub allowed_ips: Option<Vec<IpAddr>>,
    /// Run the periodic health-check loop
    pub health_checks: bool,
}

/// One running overlay node
pub struct OverlayNode {
    info: NodeInfo,
    topology: Arc<RwLock<TopologyMap>>,
    channels: Arc<MessageChannelService>,
    protocol: Arc<LinkStateProtocolManager>,
    routing: Arc<NetworkRoutingService>,
    servers: Mutex<Vec<ContactPoint>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl OverlayNode {
    /// Build and wire the components of a node; nothing is started yet
    pub async fn new(info: NodeInfo, config: CommunicationConfig) -> Arc<Self> {
        let topology = Arc::new(RwLock::new(TopologyMap::new(&info)));
        let channels = MessageChannelService::new(info.clone(), config);

        let protocol = LinkStateProtocolManager::new(topology.clone(), &channels);
        channels.register_request_handler(MESSAGE_TYPE_LSA, protocol.clone());
        channels
            .add_channel_lifecycle_listener(protocol.clone())
            .await;

        let routing = Arc::new(NetworkRoutingService::new(topology.clone(), &channels));
        let forwarding: Arc<dyn ForwardingService> = routing.clone();
        channels.set_forwarding_service(&forwarding);

        Arc::new(Self {
            info,
            topology,
            channels,
            protocol,
            routing,
            servers: Mutex::new(Vec::new()),
            health_task: Mutex::new(None),
        })
    }

    /// Identity of this node
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Node id
    pub fn node_id(&self) -> &NodeId {
        &self.info.node_id
    }

    /// Channel service
    pub fn channels(&self) -> &Arc<MessageChannelService> {
        &self.channels
    }

    /// Topology map, shared behind one lock
    pub fn topology(&self) -> &Arc<RwLock<TopologyMap>> {
        &self.topology
    }

    /// Link-state protocol manager
    pub fn protocol(&self) -> &Arc<LinkStateProtocolManager> {
        &self.protocol
    }

    /// Routing service
    pub fn routing(&self) -> &Arc<NetworkRoutingService> {
        &self.routing
    }

    /// Register a transport provider
    pub fn add_transport_provider(
        &self,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<(), NodeError> {
        Ok(self.channels.add_transport_provider(provider)?)
    }

    /// Apply the connection filter, start servers, connect to the initial contact points and
    /// start health checks.
    ///
    /// Server failures abort the start; failed initial connections are only logged. Returns
    /// the contact points actually bound.
    pub async fn start(
        self: &Arc<Self>,
        settings: &OverlayNodeSettings,
    ) -> Result<Vec<ContactPoint>, NodeError> {
        self.channels
            .connection_filter()
            .configure(settings.allowed_ips.clone());

        let mut bound = Vec::new();
        for contact_point in &settings.servers {
            bound.push(self.channels.start_server(contact_point).await?);
        }
        self.servers.lock().await.extend(bound.iter().cloned());

        for contact_point in &settings.connections {
            match self.connect(contact_point.clone(), settings.allow_duplex).await {
                Ok(channel) => info!(
                    "Connected to {} at {}",
                    channel.remote_node_info().log_description(),
                    contact_point
                ),
                Err(e) => warn!("Initial connection to {} failed: {}", contact_point, e),
            }
        }

        if settings.health_checks {
            let task = self.channels.start_periodic_health_checks();
            if let Some(previous) = self.health_task.lock().await.replace(task) {
                previous.abort();
            }
        }

        info!(
            "Node {} started ({} server(s), relay: {})",
            self.info.log_description(),
            bound.len(),
            self.info.is_relay
        );
        Ok(bound)
    }

    /// Connect to a contact point and wait for the channel
    pub async fn connect(
        &self,
        contact_point: ContactPoint,
        allow_duplex: bool,
    ) -> Result<Arc<dyn MessageChannel>, NodeError> {
        let task = self.channels.connect(contact_point, allow_duplex)?;
        let channel = task.await.map_err(|e| NodeError::Task(e.to_string()))??;
        Ok(channel)
    }

    /// Send a request to any node of the overlay
    pub async fn send(
        &self,
        message_type: &str,
        content: Bytes,
        receiver: &NodeId,
    ) -> NetworkResponse {
        self.routing
            .perform_routed_request(message_type, content, receiver)
            .await
    }

    /// Current shortest route to a node
    pub async fn route_to(&self, destination: &NodeId) -> Result<NetworkRoute, TopologyError> {
        self.topology
            .read()
            .await
            .shortest_path(&self.info.node_id, destination)
    }

    /// Link-state protocol counters
    pub fn lsa_stats(&self) -> LsaStats {
        self.protocol.stats()
    }

    /// Routing counters
    pub fn router_stats(&self) -> RouterStats {
        self.routing.stats()
    }

    /// Announce the shutdown, stop accepting connections and close all channels
    pub async fn shutdown(&self) {
        info!("Shutting down node {}", self.info.log_description());
        self.protocol.announce_shutdown().await;
        self.channels.set_shutdown_flag(true);

        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }
        for contact_point in self.servers.lock().await.drain(..) {
            if let Err(e) = self.channels.stop_server(&contact_point).await {
                warn!("Failed to stop server at {}: {}", contact_point, e);
            }
        }
        self.channels.close_all_outgoing_channels().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mesh_channel::transport::{
        VirtualNetwork, VirtualTransportProvider, VIRTUAL_TRANSPORT_ID,
    };
    use mesh_channel::NetworkRequestHandler;
    use mesh_wire::{NetworkRequest, ResultCode};
    use std::time::Duration;

    /// Answers with the hop count the request arrived with
    struct HopCounter;

    #[async_trait]
    impl NetworkRequestHandler for HopCounter {
        async fn handle_request(
            &self,
            request: &NetworkRequest,
            _last_hop: &NodeId,
        ) -> anyhow::Result<NetworkResponse> {
            Ok(NetworkResponse::success_with_payload(
                request,
                &request.metadata.hop_count,
            )?)
        }
    }

    fn id(value: &str) -> NodeId {
        NodeId::new(value).unwrap()
    }

    fn fast_config() -> CommunicationConfig {
        CommunicationConfig {
            request_timeout: Duration::from_secs(2),
            forwarding_timeout: Duration::from_millis(1500),
            ..CommunicationConfig::default()
        }
    }

    async fn start_node(
        network: &Arc<VirtualNetwork>,
        name: &str,
        relay: bool,
        connections: Vec<ContactPoint>,
    ) -> Arc<OverlayNode> {
        let info = NodeInfo::new(id(name), name.to_uppercase(), relay);
        let node = OverlayNode::new(info, fast_config()).await;
        node.add_transport_provider(Arc::new(VirtualTransportProvider::new(network.clone())))
            .unwrap();
        node.channels()
            .register_request_handler("hops", Arc::new(HopCounter));
        let settings = OverlayNodeSettings {
            servers: vec![ContactPoint::new(VIRTUAL_TRANSPORT_ID, name, 1)],
            connections,
            allow_duplex: true,
            ..Default::default()
        };
        node.start(&settings).await.unwrap();
        node
    }

    fn contact(name: &str) -> ContactPoint {
        ContactPoint::new(VIRTUAL_TRANSPORT_ID, name, 1)
    }

    /// Poll until the condition holds or two seconds passed
    async fn eventually<F, Fut>(mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..40 {
            if condition().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn knows_link(node: &OverlayNode, from: &str, to: &str) -> bool {
        node.topology()
            .read()
            .await
            .contains_link_between(&id(from), &id(to))
    }

    type Line = (
        Arc<VirtualNetwork>,
        Arc<OverlayNode>,
        Arc<OverlayNode>,
        Arc<OverlayNode>,
    );

    /// Line topology a - b - c with duplex channels
    async fn line(relay_b: bool) -> Line {
        let network = VirtualNetwork::new();
        let c = start_node(&network, "c", true, vec![]).await;
        let b = start_node(&network, "b", relay_b, vec![contact("c")]).await;
        let a = start_node(&network, "a", true, vec![contact("b")]).await;

        for node in [&a, &b, &c] {
            assert!(
                eventually(|| async move {
                    knows_link(node, "a", "b").await
                        && knows_link(node, "b", "a").await
                        && knows_link(node, "b", "c").await
                        && knows_link(node, "c", "b").await
                })
                .await,
                "{} did not converge",
                node.node_id()
            );
        }
        (network, a, b, c)
    }

    #[tokio::test]
    async fn test_maps_converge() {
        let (_network, a, b, c) = line(true).await;

        let map_a = a.topology().read().await.clone();
        let map_b = b.topology().read().await.clone();
        let map_c = c.topology().read().await.clone();
        assert_eq!(map_a, map_b);
        assert_eq!(map_b, map_c);
        assert_eq!(map_a.link_count(), 4);
        assert_eq!(map_a.node_count(), 3);

        assert!(a.lsa_stats().sent > 0);
        assert!(c.lsa_stats().accepted > 0);
    }

    #[tokio::test]
    async fn test_request_is_forwarded_by_relay() {
        let (_network, a, b, _c) = line(true).await;

        let route = a.route_to(&id("c")).await.unwrap();
        assert_eq!(route.nodes, vec![id("b"), id("c")]);

        let response = a.send("hops", Bytes::new(), &id("c")).await;
        assert!(response.is_success(), "{}", response.error_message());
        assert_eq!(response.deserialize_content::<u32>().unwrap(), 1);
        assert_eq!(response.sender, Some(id("c")));

        assert_eq!(b.router_stats().requests_forwarded, 1);
        assert_eq!(b.channels().traffic_stats()["hops"].forwarded, 1);
        assert_eq!(a.router_stats().requests_forwarded, 1);
    }

    #[tokio::test]
    async fn test_non_relay_refuses_to_forward() {
        let (_network, a, _b, _c) = line(false).await;

        let response = a.send("hops", Bytes::new(), &id("c")).await;
        assert_eq!(
            response.result_code,
            ResultCode::NoRouteToDestinationWhileForwarding
        );
    }

    #[tokio::test]
    async fn test_unknown_receiver_has_no_route_at_sender() {
        let (_network, a, _b, _c) = line(true).await;

        let response = a.send("hops", Bytes::new(), &id("nobody")).await;
        assert_eq!(response.result_code, ResultCode::NoRouteToDestinationAtSender);
        assert_eq!(
            a.router_stats()
                .drop_reasons
                .get(&crate::DropReason::NoRoute),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_local_receiver_is_handled_directly() {
        let (_network, a, _b, _c) = line(true).await;
        let response = a.send("hops", Bytes::new(), &id("a")).await;
        assert!(response.is_success());
        assert_eq!(response.deserialize_content::<u32>().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_removes_node_everywhere() {
        let (_network, a, b, c) = line(true).await;

        c.shutdown().await;
        for node in [&a, &b] {
            assert!(eventually(|| async move { node.route_to(&id("c")).await.is_err() }).await);
        }
        assert!(c.channels().all_outgoing_channels().await.is_empty());
        assert!(c.connect(contact("b"), true).await.is_err());

        let response = a.send("hops", Bytes::new(), &id("c")).await;
        assert_eq!(response.result_code, ResultCode::NoRouteToDestinationAtSender);
    }

    #[tokio::test]
    async fn test_link_failure_is_propagated() {
        let (network, a, b, _c) = line(true).await;

        assert_eq!(network.simulate_link_failure(&id("b"), &id("c")), 2);
        let a_ref = &a;
        assert!(eventually(|| async move { !knows_link(a_ref, "b", "c").await }).await);
        assert_eq!(b.channels().all_outgoing_channels().await.len(), 1);

        let response = a.send("hops", Bytes::new(), &id("c")).await;
        assert_eq!(response.result_code, ResultCode::NoRouteToDestinationAtSender);
    }

    #[tokio::test]
    async fn test_topology_changes_are_observable() {
        let network = VirtualNetwork::new();
        let b = start_node(&network, "b", true, vec![]).await;
        let mut changes = b.protocol().subscribe();
        let before = *changes.borrow_and_update();

        let _a = start_node(&network, "a", true, vec![contact("b")]).await;
        tokio::time::timeout(Duration::from_secs(2), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*changes.borrow() > before);
    }
}
