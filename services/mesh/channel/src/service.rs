//! Message channel service: connection setup, the registry of outgoing channels, listener
//! notification, request dispatch and health monitoring.

use crate::callbacks::{callback, ListenerId, OrderedCallbackManager};
use crate::handler::{NetworkRequestHandler, RequestHandlerRegistry};
use crate::health::{HealthCheckHandler, HealthState};
use crate::listener::{ChannelLifecycleListener, TrafficListener};
use crate::stats::{TrafficCounters, TrafficStats};
use crate::transport::TransportProvider;
use crate::{
    describe, BrokenChannelListener, ChannelError, CommunicationConfig, ConnectionFilter,
    EndpointHandler, ForwardingService, MessageChannel,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_wire::{ContactPoint, NodeInfo, MESSAGE_TYPE_HEALTH_CHECK};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns all outgoing channels of one node
pub struct MessageChannelService {
    local: NodeInfo,
    config: CommunicationConfig,
    self_ref: Weak<MessageChannelService>,
    /// Active outgoing channels by id
    channels: RwLock<BTreeMap<String, Arc<dyn MessageChannel>>>,
    /// Health state per registered channel; entries are removed on unregistration
    health: DashMap<String, Arc<HealthState>>,
    transports: DashMap<String, Arc<dyn TransportProvider>>,
    handlers: RequestHandlerRegistry,
    lifecycle_listeners: OrderedCallbackManager<dyn ChannelLifecycleListener>,
    traffic_listeners: OrderedCallbackManager<dyn TrafficListener>,
    forwarding: OnceCell<Weak<dyn ForwardingService>>,
    filter: Arc<ConnectionFilter>,
    stats: TrafficStats,
    shutting_down: AtomicBool,
}

impl MessageChannelService {
    /// Create the service for the given local node
    pub fn new(local: NodeInfo, config: CommunicationConfig) -> Arc<Self> {
        let service = Arc::new_cyclic(|self_ref| Self {
            local,
            config,
            self_ref: self_ref.clone(),
            channels: RwLock::new(BTreeMap::new()),
            health: DashMap::new(),
            transports: DashMap::new(),
            handlers: RequestHandlerRegistry::new(),
            lifecycle_listeners: OrderedCallbackManager::new("channel lifecycle"),
            traffic_listeners: OrderedCallbackManager::new("traffic"),
            forwarding: OnceCell::new(),
            filter: Arc::new(ConnectionFilter::new()),
            stats: TrafficStats::new(),
            shutting_down: AtomicBool::new(false),
        });
        service
            .handlers
            .register(MESSAGE_TYPE_HEALTH_CHECK, Arc::new(HealthCheckHandler));
        service
    }

    /// Identity of the local node
    pub fn local_node_info(&self) -> &NodeInfo {
        &self.local
    }

    /// Communication tunables
    pub fn config(&self) -> &CommunicationConfig {
        &self.config
    }

    /// Connection filter shared with the transports' servers
    pub fn connection_filter(&self) -> &Arc<ConnectionFilter> {
        &self.filter
    }

    /// Traffic counters by message type
    pub fn traffic_stats(&self) -> BTreeMap<String, TrafficCounters> {
        self.stats.snapshot()
    }

    /// Handler for transports to call into this service
    pub fn endpoint_handler(&self) -> Arc<dyn EndpointHandler> {
        Arc::new(ServiceEndpoint {
            service: self.self_ref.clone(),
        })
    }

    /// Listener for transports to report lost connections
    pub fn broken_channel_listener(&self) -> Arc<dyn BrokenChannelListener> {
        Arc::new(ServiceEndpoint {
            service: self.self_ref.clone(),
        })
    }

    /// Set the component that forwards requests for other nodes; only the first call has effect
    pub fn set_forwarding_service(&self, forwarding: &Arc<dyn ForwardingService>) {
        if self.forwarding.set(Arc::downgrade(forwarding)).is_err() {
            warn!("Forwarding service already set; ignoring replacement");
        }
    }

    pub(crate) fn forwarding_service(&self) -> Option<Arc<dyn ForwardingService>> {
        self.forwarding.get().and_then(Weak::upgrade)
    }

    /// Register a handler for locally destined requests of a message type
    pub fn register_request_handler(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn NetworkRequestHandler>,
    ) {
        self.handlers.register(message_type, handler);
    }

    /// Remove the handler for a message type
    pub fn unregister_request_handler(&self, message_type: &str) -> bool {
        self.handlers.unregister(message_type)
    }

    pub(crate) fn handlers(&self) -> &RequestHandlerRegistry {
        &self.handlers
    }

    pub(crate) fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    /// Set or clear the shutdown flag; while set, no new connections are made or accepted
    pub fn set_shutdown_flag(&self, shutting_down: bool) {
        self.shutting_down.store(shutting_down, Ordering::Release);
    }

    /// Whether the shutdown flag is set
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Register a transport provider under its id
    pub fn add_transport_provider(
        &self,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<(), ChannelError> {
        let id = provider.transport_id().to_string();
        match self.transports.entry(id.clone()) {
            Entry::Occupied(_) => Err(ChannelError::DuplicateTransport(id)),
            Entry::Vacant(slot) => {
                slot.insert(provider);
                debug!("Registered transport provider '{}'", id);
                Ok(())
            }
        }
    }

    /// Remove a registered transport provider; fails unless this exact provider is registered
    pub fn remove_transport_provider(
        &self,
        provider: &Arc<dyn TransportProvider>,
    ) -> Result<(), ChannelError> {
        let id = provider.transport_id();
        let removed = self
            .transports
            .remove_if(id, |_, registered| Arc::ptr_eq(registered, provider));
        match removed {
            Some(_) => Ok(()),
            None => Err(ChannelError::UnknownTransport(id.to_string())),
        }
    }

    fn transport_for(
        &self,
        contact_point: &ContactPoint,
    ) -> Result<Arc<dyn TransportProvider>, ChannelError> {
        self.transports
            .get(&contact_point.transport_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| ChannelError::UnknownTransport(contact_point.transport_id.clone()))
    }

    /// Start a server at the contact point; returns the contact point actually bound
    pub async fn start_server(
        &self,
        contact_point: &ContactPoint,
    ) -> Result<ContactPoint, ChannelError> {
        let transport = self.transport_for(contact_point)?;
        let bound = transport
            .start_server(contact_point, self.endpoint_handler(), self.filter.clone())
            .await?;
        info!("Accepting connections at {}", bound);
        Ok(bound)
    }

    /// Stop the server at the contact point
    pub async fn stop_server(&self, contact_point: &ContactPoint) -> Result<(), ChannelError> {
        self.transport_for(contact_point)?
            .stop_server(contact_point)
            .await
    }

    /// Connect to a contact point on a worker task.
    ///
    /// Fails immediately if the service is shutting down or the transport is unknown. The
    /// returned task resolves to the registered channel, or the connection error (in which case
    /// nothing was registered).
    pub fn connect(
        &self,
        contact_point: ContactPoint,
        allow_duplex: bool,
    ) -> Result<JoinHandle<Result<Arc<dyn MessageChannel>, ChannelError>>, ChannelError> {
        if self.is_shutting_down() {
            return Err(ChannelError::ShuttingDown);
        }
        let transport = self.transport_for(&contact_point)?;
        let service = self.self_ref.upgrade().ok_or(ChannelError::ShuttingDown)?;

        Ok(tokio::spawn(async move {
            debug!("Connecting to {} (duplex: {})", contact_point, allow_duplex);
            let duplex = allow_duplex && transport.supports_duplex();
            let channel = transport
                .connect(
                    &contact_point,
                    &service.local,
                    duplex,
                    service.endpoint_handler(),
                    service.broken_channel_listener(),
                )
                .await
                .map_err(|e| {
                    warn!("Failed to connect to {}: {}", contact_point, e);
                    e
                })?;

            if service.is_shutting_down() {
                channel.close();
                return Err(ChannelError::ShuttingDown);
            }
            service.register_new_outgoing_channel(channel.clone()).await;
            Ok(channel)
        }))
    }

    /// Add a channel to the registry and notify lifecycle listeners
    pub async fn register_new_outgoing_channel(&self, channel: Arc<dyn MessageChannel>) {
        let id = channel.channel_id().to_string();
        let mut channels = self.channels.write().await;
        if channels.insert(id.clone(), channel.clone()).is_some() {
            warn!("Replaced already registered channel {}", id);
        }
        self.health.insert(id, Arc::new(HealthState::default()));
        // enqueued under the registry lock so listeners see events in registry order
        self.lifecycle_listeners
            .enqueue(callback(move |l: Arc<dyn ChannelLifecycleListener>| {
                let channel = channel.clone();
                async move { l.on_outgoing_channel_established(channel).await }
            }));
        drop(channels);
    }

    /// Remove a closed or broken channel and notify lifecycle listeners
    async fn unregister_channel(&self, channel: &Arc<dyn MessageChannel>) -> bool {
        let id = channel.channel_id();
        let mut channels = self.channels.write().await;
        if channels.remove(id).is_none() {
            warn!("Channel {} was not registered when unregistering it", id);
            return false;
        }
        self.health.remove(id);
        let channel = channel.clone();
        self.lifecycle_listeners
            .enqueue(callback(move |l: Arc<dyn ChannelLifecycleListener>| {
                let channel = channel.clone();
                async move { l.on_outgoing_channel_terminated(channel).await }
            }));
        true
    }

    /// Close a channel gracefully; unregisters only if the close actually happened
    pub async fn close_outgoing_channel(&self, channel: &Arc<dyn MessageChannel>) -> bool {
        if !channel.close() {
            debug!("Channel {} was not open; nothing to close", describe(channel.as_ref()));
            return false;
        }
        info!("Closed channel {}", describe(channel.as_ref()));
        self.unregister_channel(channel).await
    }

    /// Close every currently registered channel
    pub async fn close_all_outgoing_channels(&self) {
        let snapshot = self.all_outgoing_channels().await;
        for channel in &snapshot {
            self.close_outgoing_channel(channel).await;
        }

        let remaining: Vec<String> = self.channels.read().await.keys().cloned().collect();
        if !remaining.is_empty() {
            warn!(
                "{} channel(s) still registered after closing all outgoing channels: {:?}",
                remaining.len(),
                remaining
            );
        }
    }

    /// Mark a channel as broken and unregister it; no-op if it was already closed or broken
    pub async fn handle_broken_channel(&self, channel: &Arc<dyn MessageChannel>) -> bool {
        if !channel.mark_as_broken() {
            debug!(
                "Channel {} already closed or broken",
                describe(channel.as_ref())
            );
            return false;
        }
        warn!("Channel {} is broken", describe(channel.as_ref()));
        self.unregister_channel(channel).await
    }

    pub(crate) fn spawn_broken_channel_handling(&self, channel: Arc<dyn MessageChannel>) {
        if let Some(service) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                service.handle_broken_channel(&channel).await;
            });
        }
    }

    /// Snapshot of all registered channels, ordered by id
    pub async fn all_outgoing_channels(&self) -> Vec<Arc<dyn MessageChannel>> {
        self.channels.read().await.values().cloned().collect()
    }

    /// Look up a registered channel
    pub async fn outgoing_channel_by_id(&self, channel_id: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.read().await.get(channel_id).cloned()
    }

    /// Health state of a registered channel
    pub fn health_state(&self, channel_id: &str) -> Option<Arc<HealthState>> {
        self.health.get(channel_id).map(|s| s.value().clone())
    }

    /// Register a lifecycle listener; its first callback is the current channel snapshot
    pub async fn add_channel_lifecycle_listener(
        &self,
        listener: Arc<dyn ChannelLifecycleListener>,
    ) -> ListenerId {
        // hold the registry so no event slips between snapshot and registration
        let channels = self.channels.read().await;
        let snapshot: Vec<Arc<dyn MessageChannel>> = channels.values().cloned().collect();
        let initial = callback(move |l: Arc<dyn ChannelLifecycleListener>| {
            let snapshot = snapshot.clone();
            async move { l.set_initial_message_channels(snapshot).await }
        });
        let id = self.lifecycle_listeners.add_listener(listener, Some(initial));
        drop(channels);
        id
    }

    /// Remove a lifecycle listener
    pub fn remove_channel_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.lifecycle_listeners.remove_listener(id)
    }

    /// Register a traffic listener
    pub fn add_traffic_listener(&self, listener: Arc<dyn TrafficListener>) -> ListenerId {
        self.traffic_listeners.add_listener(listener, None)
    }

    /// Remove a traffic listener
    pub fn remove_traffic_listener(&self, id: ListenerId) -> bool {
        self.traffic_listeners.remove_listener(id)
    }

    pub(crate) fn traffic_listeners(&self) -> &OrderedCallbackManager<dyn TrafficListener> {
        &self.traffic_listeners
    }

    /// Close outgoing channels paired with a closed inbound channel
    async fn close_mirrors_of(&self, inbound_channel_id: &str) {
        let mirrors: Vec<Arc<dyn MessageChannel>> = self
            .channels
            .read()
            .await
            .values()
            .filter(|c| {
                c.core().associated_mirror_channel_id().as_deref() == Some(inbound_channel_id)
            })
            .cloned()
            .collect();

        for channel in mirrors {
            if channel.is_ready_to_use() {
                debug!(
                    "Closing {} because its mirror channel {} closed",
                    describe(channel.as_ref()),
                    inbound_channel_id
                );
                channel.core().mark_closed_because_mirror_closed();
                self.close_outgoing_channel(&channel).await;
            }
        }
    }
}

// Include implementation
mod checks;
mod dispatch;

#[cfg(test)]
mod tests;

/// Adapter handed to transports; holds the service weakly so transports never keep it alive
struct ServiceEndpoint {
    service: Weak<MessageChannelService>,
}

#[async_trait::async_trait]
impl EndpointHandler for ServiceEndpoint {
    fn exchange_node_information(&self, remote: &NodeInfo) -> Result<NodeInfo, ChannelError> {
        let service = self.service.upgrade().ok_or(ChannelError::ShuttingDown)?;
        if service.is_shutting_down() {
            return Err(ChannelError::ShuttingDown);
        }
        if remote.node_id == service.local.node_id {
            return Err(ChannelError::Handshake(format!(
                "remote node {} has the local node id",
                remote.log_description()
            )));
        }
        debug!(
            "Exchanged node information with {}",
            remote.log_description()
        );
        Ok(service.local.clone())
    }

    async fn on_remote_initiated_channel_established(&self, channel: Arc<dyn MessageChannel>) {
        match self.service.upgrade() {
            Some(service) if !service.is_shutting_down() => {
                info!(
                    "Remote-initiated channel {} established",
                    describe(channel.as_ref())
                );
                service.register_new_outgoing_channel(channel).await;
            }
            _ => {
                channel.close();
            }
        }
    }

    fn on_inbound_channel_closing(&self, inbound_channel_id: &str) {
        if let Some(service) = self.service.upgrade() {
            let inbound_channel_id = inbound_channel_id.to_string();
            tokio::spawn(async move {
                service.close_mirrors_of(&inbound_channel_id).await;
            });
        }
    }

    async fn on_raw_request_received(
        &self,
        request: mesh_wire::NetworkRequest,
        last_hop: mesh_wire::NodeId,
    ) -> mesh_wire::NetworkResponse {
        match self.service.upgrade() {
            Some(service) => service.handle_incoming_request(request, last_hop).await,
            None => mesh_wire::NetworkResponse::channel_closed_or_broken(&request, "-"),
        }
    }
}

impl BrokenChannelListener for ServiceEndpoint {
    fn on_channel_broken(&self, channel: Arc<dyn MessageChannel>) {
        if channel.core().initiated_by_remote() {
            debug!(
                "Ignoring broken-channel report for remote-initiated channel {}",
                describe(channel.as_ref())
            );
            return;
        }
        if let Some(service) = self.service.upgrade() {
            service.spawn_broken_channel_handling(channel);
        }
    }
}
