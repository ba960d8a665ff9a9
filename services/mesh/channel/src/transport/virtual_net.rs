//! In-process transport for tests and simulations.
//!
//! Nodes attached to the same [`VirtualNetwork`] reach each other by contact point without any
//! socket. Faults can be injected per receiving node, and links can be cut to exercise broken
//! channel handling.

use super::TransportProvider;
use crate::{
    BrokenChannelListener, ChannelCore, ChannelError, ConnectionFilter, EndpointHandler,
    MessageChannel,
};
use async_trait::async_trait;
use dashmap::DashMap;
use mesh_wire::{ContactPoint, NetworkRequest, NetworkResponse, NodeId, NodeInfo};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Transport id of the in-process transport
pub const VIRTUAL_TRANSPORT_ID: &str = "virtual";

const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// Behaviour of a node when it receives a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VirtualFault {
    /// Requests are delivered
    #[default]
    Healthy,
    /// Requests and connections fail immediately
    Refuse,
    /// Requests are never answered
    Swallow,
}

struct LiveChannel {
    channel: Weak<VirtualChannel>,
    /// Set for channels opened by the local node
    broken_listener: Option<Arc<dyn BrokenChannelListener>>,
    /// Endpoint of the node owning the channel
    owner_endpoint: Arc<dyn EndpointHandler>,
}

type CutChannel = (
    Arc<VirtualChannel>,
    Option<Arc<dyn BrokenChannelListener>>,
    Arc<dyn EndpointHandler>,
);

/// Shared medium connecting virtual transports
#[derive(Default)]
pub struct VirtualNetwork {
    servers: DashMap<String, Arc<dyn EndpointHandler>>,
    faults: DashMap<NodeId, VirtualFault>,
    live: DashMap<String, LiveChannel>,
    next_port: AtomicU16,
}

impl VirtualNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            ..Default::default()
        })
    }

    /// Inject a fault for requests received by `node`
    pub fn set_fault(&self, node: &NodeId, fault: VirtualFault) {
        if fault == VirtualFault::Healthy {
            self.faults.remove(node);
        } else {
            self.faults.insert(node.clone(), fault);
        }
    }

    /// Current fault of a node
    pub fn fault(&self, node: &NodeId) -> VirtualFault {
        self.faults.get(node).map(|f| *f).unwrap_or_default()
    }

    /// Cut every channel between two nodes, as if the connection dropped.
    ///
    /// Channels opened by either node are reported to their broken-channel listener; mirror
    /// channels are reported to their owner as a closed inbound connection. Returns the number of
    /// channels affected.
    pub fn simulate_link_failure(&self, a: &NodeId, b: &NodeId) -> usize {
        let affected: Vec<CutChannel> = self
            .live
            .iter()
            .filter_map(|entry| {
                let live = entry.value();
                let channel = live.channel.upgrade()?;
                let remote = &channel.remote_node_info().node_id;
                let connects = (&channel.local_id == a && remote == b)
                    || (&channel.local_id == b && remote == a);
                connects.then(|| {
                    (
                        channel.clone(),
                        live.broken_listener.clone(),
                        live.owner_endpoint.clone(),
                    )
                })
            })
            .collect();

        for (channel, _, _) in &affected {
            channel.link_lost.store(true, Ordering::Release);
        }
        for (channel, broken_listener, owner_endpoint) in &affected {
            debug!("Cutting virtual channel {}", channel.channel_id());
            match broken_listener {
                Some(listener) => listener.on_channel_broken(channel.clone()),
                None => {
                    // the mirror's owner sees the inbound side of the original channel vanish
                    if let Some(inbound_id) = channel.core().associated_mirror_channel_id() {
                        owner_endpoint.on_inbound_channel_closing(&inbound_id);
                    }
                }
            }
        }
        affected.len()
    }

    /// Number of channels currently open on the network
    pub fn live_channel_count(&self) -> usize {
        self.live.len()
    }

    fn register(
        &self,
        channel: &Arc<VirtualChannel>,
        broken_listener: Option<Arc<dyn BrokenChannelListener>>,
        owner_endpoint: Arc<dyn EndpointHandler>,
    ) {
        self.live.insert(
            channel.channel_id().to_string(),
            LiveChannel {
                channel: Arc::downgrade(channel),
                broken_listener,
                owner_endpoint,
            },
        );
    }
}

/// Channel carried by a [`VirtualNetwork`]
pub struct VirtualChannel {
    core: ChannelCore,
    local_id: NodeId,
    remote_endpoint: Arc<dyn EndpointHandler>,
    network: Arc<VirtualNetwork>,
    link_lost: AtomicBool,
}

impl fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("core", &self.core)
            .field("local_id", &self.local_id)
            .field("link_lost", &self.link_lost)
            .finish()
    }
}

impl VirtualChannel {
    fn new(
        remote_node_info: NodeInfo,
        initiated_by_remote: bool,
        local_id: NodeId,
        remote_endpoint: Arc<dyn EndpointHandler>,
        network: Arc<VirtualNetwork>,
    ) -> Self {
        Self {
            core: ChannelCore::new(
                ChannelCore::generate_id(),
                remote_node_info,
                initiated_by_remote,
            ),
            local_id,
            remote_endpoint,
            network,
            link_lost: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessageChannel for VirtualChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn send_raw_request(
        &self,
        request: NetworkRequest,
    ) -> Result<NetworkResponse, ChannelError> {
        if !self.is_ready_to_use() {
            return Err(ChannelError::Closed(self.channel_id().to_string()));
        }
        if self.link_lost.load(Ordering::Acquire) {
            return Err(ChannelError::Broken(
                self.channel_id().to_string(),
                "virtual link lost".to_string(),
            ));
        }

        let remote = &self.remote_node_info().node_id;
        match self.network.fault(remote) {
            VirtualFault::Healthy => Ok(self
                .remote_endpoint
                .on_raw_request_received(request, self.local_id.clone())
                .await),
            VirtualFault::Refuse => Err(ChannelError::Transport(format!(
                "request refused by {}",
                remote
            ))),
            VirtualFault::Swallow => futures::future::pending().await,
        }
    }

    fn on_close(&self) {
        self.network.live.remove(self.channel_id());
        if !self.core.closed_because_mirror_closed() && !self.link_lost.load(Ordering::Acquire) {
            self.remote_endpoint
                .on_inbound_channel_closing(self.channel_id());
        }
    }

    fn on_broken(&self) {
        self.network.live.remove(self.channel_id());
    }
}

/// Transport provider over a shared [`VirtualNetwork`]
pub struct VirtualTransportProvider {
    network: Arc<VirtualNetwork>,
}

impl VirtualTransportProvider {
    /// Create a provider attached to the network
    pub fn new(network: Arc<VirtualNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl TransportProvider for VirtualTransportProvider {
    fn transport_id(&self) -> &str {
        VIRTUAL_TRANSPORT_ID
    }

    async fn connect(
        &self,
        contact_point: &ContactPoint,
        local: &NodeInfo,
        allow_duplex: bool,
        endpoint: Arc<dyn EndpointHandler>,
        broken_listener: Arc<dyn BrokenChannelListener>,
    ) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        let server = self
            .network
            .servers
            .get(&contact_point.socket_address())
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                ChannelError::Transport(format!("connection refused: nothing at {}", contact_point))
            })?;

        let remote = server.exchange_node_information(local)?;
        endpoint.exchange_node_information(&remote)?;
        if self.network.fault(&remote.node_id) == VirtualFault::Refuse {
            return Err(ChannelError::Transport(format!(
                "connection refused by {}",
                remote.node_id
            )));
        }

        let channel = Arc::new(VirtualChannel::new(
            remote.clone(),
            false,
            local.node_id.clone(),
            server.clone(),
            self.network.clone(),
        ));

        if allow_duplex {
            let mirror = Arc::new(VirtualChannel::new(
                local.clone(),
                true,
                remote.node_id.clone(),
                endpoint.clone(),
                self.network.clone(),
            ));
            mirror
                .core()
                .set_associated_mirror_channel_id(Some(channel.channel_id().to_string()));
            channel
                .core()
                .set_associated_mirror_channel_id(Some(mirror.channel_id().to_string()));
            mirror.core().mark_established();
            self.network.register(&mirror, None, server.clone());
            server
                .on_remote_initiated_channel_established(mirror)
                .await;
        }

        channel.core().mark_established();
        self.network
            .register(&channel, Some(broken_listener), endpoint);
        Ok(channel)
    }

    async fn start_server(
        &self,
        contact_point: &ContactPoint,
        endpoint: Arc<dyn EndpointHandler>,
        _filter: Arc<ConnectionFilter>,
    ) -> Result<ContactPoint, ChannelError> {
        // virtual connections carry no peer address, so the filter does not apply
        let mut bound = contact_point.clone();
        if bound.port == 0 {
            bound.port = self.network.next_port.fetch_add(1, Ordering::Relaxed);
        }

        match self.network.servers.entry(bound.socket_address()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ChannelError::Transport(format!(
                "address {} already in use",
                bound
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(endpoint);
                Ok(bound)
            }
        }
    }

    async fn stop_server(&self, contact_point: &ContactPoint) -> Result<(), ChannelError> {
        self.network
            .servers
            .remove(&contact_point.socket_address())
            .map(|_| ())
            .ok_or_else(|| ChannelError::Transport(format!("no server at {}", contact_point)))
    }
}
