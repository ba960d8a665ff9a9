//! Link-state protocol: keeps the topology map in sync with the channel registry and floods
//! link-state advertisements to the rest of the overlay.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use mesh_channel::{
    describe, ChannelLifecycleListener, MessageChannel, MessageChannelService,
    NetworkRequestHandler,
};
use mesh_topology::TopologyMap;
use mesh_wire::{
    LinkStateAdvertisement, LsaBatch, LsaPayload, NetworkRequest, NetworkResponse, NodeId,
    MESSAGE_TYPE_LSA,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Link-state protocol counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LsaStats {
    /// LSA messages sent, one per channel
    pub sent: u64,
    /// LSAs received, batch entries counted individually
    pub received: u64,
    /// Received LSAs merged into the map
    pub accepted: u64,
    /// Received LSAs rejected as stale or invalid
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct AtomicLsaStats {
    sent: AtomicU64,
    received: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Maintains the local node's outgoing links and exchanges LSAs with neighbours.
///
/// Registered with the channel service both as lifecycle listener and as the handler of
/// [`MESSAGE_TYPE_LSA`] requests.
pub struct LinkStateProtocolManager {
    self_ref: Weak<LinkStateProtocolManager>,
    local_node_id: NodeId,
    topology: Arc<RwLock<TopologyMap>>,
    channels: Weak<MessageChannelService>,
    stats: AtomicLsaStats,
    changes: watch::Sender<u64>,
    shutting_down: AtomicBool,
}

impl LinkStateProtocolManager {
    /// Create a manager for the channel service's node
    pub fn new(
        topology: Arc<RwLock<TopologyMap>>,
        channels: &Arc<MessageChannelService>,
    ) -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            local_node_id: channels.local_node_info().node_id.clone(),
            topology,
            channels: Arc::downgrade(channels),
            stats: AtomicLsaStats::default(),
            changes,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Protocol counters
    pub fn stats(&self) -> LsaStats {
        LsaStats {
            sent: self.stats.sent.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    /// Receiver notified with a version number after every topology change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify_topology_changed(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Increment the local sequence number and flood the local node's links
    pub async fn broadcast_new_local_lsa(&self) {
        let lsa = self.topology.write().await.generate_new_local_lsa();
        debug!("Broadcasting {}", lsa);
        self.flood(vec![lsa]).await;
    }

    /// Flood a shutdown LSA and wait until it was sent over every channel.
    ///
    /// Afterwards channel events no longer trigger announcements.
    pub async fn announce_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let lsa = self.topology.write().await.generate_shutdown_lsa();
        info!("Announcing shutdown of {} to all neighbours", self.local_node_id);
        self.flood(vec![lsa]).await;
    }

    /// Merge one LSA; returns whether it was accepted
    async fn merge(&self, lsa: &LinkStateAdvertisement) -> bool {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let accepted = self.topology.write().await.update(lsa);
        if accepted {
            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            debug!("Accepted {}", lsa);
            self.notify_topology_changed();
        } else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Merge a batch; returns the accepted LSAs for re-flooding
    async fn merge_batch(&self, batch: LsaBatch) -> Vec<LinkStateAdvertisement> {
        let mut accepted = Vec::new();
        for lsa in batch {
            if self.merge(&lsa).await {
                accepted.push(lsa);
            }
        }
        accepted
    }

    /// Send LSAs to every outgoing channel and wait for the sends to complete
    async fn flood(&self, lsas: Vec<LinkStateAdvertisement>) {
        if lsas.is_empty() {
            return;
        }
        let Some(service) = self.channels.upgrade() else {
            return;
        };
        let channels = service.all_outgoing_channels().await;

        let mut sends = Vec::new();
        for lsa in &lsas {
            for channel in &channels {
                let request = match lsa_request(
                    &LsaPayload::Single(lsa.clone()),
                    &self.local_node_id,
                    channel.as_ref(),
                ) {
                    Ok(request) => request,
                    Err(e) => {
                        error!("Failed to encode {}: {}", lsa, e);
                        continue;
                    }
                };
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                let service = service.clone();
                let channel = channel.clone();
                sends.push(async move {
                    let response = service.send_request(request, &channel).await;
                    if !response.is_success() {
                        warn!(
                            "Failed to send LSA over channel {}: {}",
                            describe(channel.as_ref()),
                            response.error_message()
                        );
                    }
                });
            }
        }
        join_all(sends).await;
    }

    /// Flood on a worker task so that the request handler answers without waiting for neighbours
    fn spawn_flood(&self, lsas: Vec<LinkStateAdvertisement>) {
        if lsas.is_empty() {
            return;
        }
        if let Some(this) = self.self_ref.upgrade() {
            tokio::spawn(async move { this.flood(lsas).await });
        }
    }

    /// Add the local link backing a channel; returns whether the map changed
    async fn add_channel_link(&self, channel: &dyn MessageChannel) -> bool {
        let remote = channel.remote_node_info();
        let mut topology = self.topology.write().await;
        if !topology.contains_node(&remote.node_id) {
            topology.add_or_update_node(remote);
        }
        let added =
            topology.add_link_between(&self.local_node_id, &remote.node_id, channel.channel_id());
        match added {
            Ok(link) => {
                debug!("Added local link {}", link);
                true
            }
            Err(e) => {
                error!("Topology consistency error: {}", e);
                false
            }
        }
    }

    /// Exchange full batches with the peer of a self-initiated channel
    async fn exchange_batches(&self, channel: &Arc<dyn MessageChannel>) {
        let Some(service) = self.channels.upgrade() else {
            return;
        };
        let batch = self.topology.write().await.generate_lsa_batch_of_all_nodes();
        let request = match lsa_request(
            &LsaPayload::Batch(batch),
            &self.local_node_id,
            channel.as_ref(),
        ) {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to encode LSA batch: {}", e);
                return;
            }
        };
        self.stats.sent.fetch_add(1, Ordering::Relaxed);

        let response = service.send_request(request, channel).await;
        if !response.is_success() {
            warn!(
                "Initial LSA exchange over {} failed: {}",
                describe(channel.as_ref()),
                response.error_message()
            );
            return;
        }
        match response.deserialize_content::<LsaPayload>() {
            Ok(LsaPayload::Batch(remote_batch)) => {
                let accepted = self.merge_batch(remote_batch).await;
                debug!(
                    "Merged {} LSAs from the initial exchange with {}",
                    accepted.len(),
                    channel.remote_node_info().log_description()
                );
                self.flood(accepted).await;
            }
            Ok(LsaPayload::Single(_)) => {
                warn!("Expected an LSA batch in response to the initial exchange")
            }
            Err(e) => warn!("Invalid LSA batch response: {}", e),
        }
    }
}

fn lsa_request(
    payload: &LsaPayload,
    sender: &NodeId,
    channel: &dyn MessageChannel,
) -> Result<NetworkRequest, mesh_wire::WireError> {
    NetworkRequest::with_payload(
        MESSAGE_TYPE_LSA,
        payload,
        Some(sender.clone()),
        Some(channel.remote_node_info().node_id.clone()),
    )
}

#[async_trait]
impl ChannelLifecycleListener for LinkStateProtocolManager {
    async fn set_initial_message_channels(&self, channels: Vec<Arc<dyn MessageChannel>>) {
        let mut changed = false;
        for channel in &channels {
            changed |= self.add_channel_link(channel.as_ref()).await;
        }
        if changed {
            self.notify_topology_changed();
            self.broadcast_new_local_lsa().await;
        }
    }

    async fn on_outgoing_channel_established(&self, channel: Arc<dyn MessageChannel>) {
        if self.add_channel_link(channel.as_ref()).await {
            self.notify_topology_changed();
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        if !channel.core().initiated_by_remote() {
            self.exchange_batches(&channel).await;
        }
        self.broadcast_new_local_lsa().await;
    }

    async fn on_outgoing_channel_terminated(&self, channel: Arc<dyn MessageChannel>) {
        {
            let mut topology = self.topology.write().await;
            let link = topology.link_for_connection(channel.channel_id()).cloned();
            match link {
                Some(link) => {
                    topology.remove_link(&link);
                    debug!("Removed local link {}", link);
                }
                // the remote node may already be gone after its shutdown notice
                None => debug!(
                    "No local link for terminated channel {}",
                    channel.channel_id()
                ),
            }
        }
        self.notify_topology_changed();
        if !self.shutting_down.load(Ordering::Acquire) {
            self.broadcast_new_local_lsa().await;
        }
    }
}

#[async_trait]
impl NetworkRequestHandler for LinkStateProtocolManager {
    async fn handle_request(
        &self,
        request: &NetworkRequest,
        last_hop: &NodeId,
    ) -> anyhow::Result<NetworkResponse> {
        match request.deserialize_content::<LsaPayload>()? {
            LsaPayload::Batch(batch) => {
                debug!("Received LSA batch of {} from {}", batch.len(), last_hop);
                let accepted = self.merge_batch(batch).await;
                self.spawn_flood(accepted);
                let own = self.topology.write().await.generate_lsa_batch_of_all_nodes();
                Ok(NetworkResponse::success_with_payload(
                    request,
                    &LsaPayload::Batch(own),
                )?)
            }
            LsaPayload::Single(lsa) => {
                if self.merge(&lsa).await {
                    self.spawn_flood(vec![lsa]);
                }
                Ok(NetworkResponse::success(request, Bytes::new()))
            }
        }
    }
}
