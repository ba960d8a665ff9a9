use super::*;
use crate::transport::{VirtualFault, VirtualNetwork, VirtualTransportProvider, VIRTUAL_TRANSPORT_ID};
use crate::HealthCheckOutcome;
use async_trait::async_trait;
use bytes::Bytes;
use crate::NetworkRequestHandler;
use mesh_wire::{NetworkRequest, NetworkResponse, NodeId, ResultCode, MESSAGE_TYPE_HEALTH_CHECK};
use std::sync::Mutex;
use std::time::Duration;

fn node(id: &str, relay: bool) -> NodeInfo {
    NodeInfo::new(NodeId::new(id).unwrap(), id.to_uppercase(), relay)
}

fn fast_config() -> CommunicationConfig {
    CommunicationConfig {
        request_timeout: Duration::from_millis(300),
        forwarding_timeout: Duration::from_millis(250),
        health_check_interval: Duration::from_millis(50),
        health_check_max_jitter: Duration::ZERO,
        health_check_timeout: Duration::from_millis(100),
        health_check_failure_limit: 3,
    }
}

async fn service_on(
    network: &Arc<VirtualNetwork>,
    id: &str,
    relay: bool,
) -> (Arc<MessageChannelService>, ContactPoint) {
    let service = MessageChannelService::new(node(id, relay), fast_config());
    service
        .add_transport_provider(Arc::new(VirtualTransportProvider::new(network.clone())))
        .unwrap();
    let bound = service
        .start_server(&ContactPoint::new(VIRTUAL_TRANSPORT_ID, id, 0))
        .await
        .unwrap();
    (service, bound)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelLifecycleListener for RecordingListener {
    async fn set_initial_message_channels(&self, channels: Vec<Arc<dyn MessageChannel>>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("initial:{}", channels.len()));
    }

    async fn on_outgoing_channel_established(&self, channel: Arc<dyn MessageChannel>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("up:{}", channel.remote_node_info().node_id));
    }

    async fn on_outgoing_channel_terminated(&self, channel: Arc<dyn MessageChannel>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("down:{}", channel.remote_node_info().node_id));
    }
}

struct FixedForwarder;

#[async_trait]
impl ForwardingService for FixedForwarder {
    async fn forward(&self, request: NetworkRequest) -> NetworkResponse {
        NetworkResponse::success(&request, Bytes::from_static(b"forwarded"))
    }
}

/// Answers as if the remote end of the channel were already gone
struct GoneRemote;

#[async_trait]
impl NetworkRequestHandler for GoneRemote {
    async fn handle_request(
        &self,
        request: &NetworkRequest,
        _last_hop: &NodeId,
    ) -> anyhow::Result<NetworkResponse> {
        Ok(NetworkResponse::channel_closed_or_broken(request, "gone"))
    }
}

async fn run_checks(service: &Arc<MessageChannelService>) -> Vec<HealthCheckOutcome> {
    let mut outcomes = Vec::new();
    for handle in service.trigger_health_check_for_all_channels().await {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn test_transport_registration() {
    let network = VirtualNetwork::new();
    let service = MessageChannelService::new(node("a", false), fast_config());
    let provider: Arc<dyn TransportProvider> =
        Arc::new(VirtualTransportProvider::new(network.clone()));

    service.add_transport_provider(provider.clone()).unwrap();
    assert!(matches!(
        service.add_transport_provider(Arc::new(VirtualTransportProvider::new(network))),
        Err(ChannelError::DuplicateTransport(_))
    ));

    let other: Arc<dyn TransportProvider> =
        Arc::new(VirtualTransportProvider::new(VirtualNetwork::new()));
    assert!(service.remove_transport_provider(&other).is_err());
    assert!(service.remove_transport_provider(&provider).is_ok());
    assert!(matches!(
        service.connect(ContactPoint::new(VIRTUAL_TRANSPORT_ID, "b", 1), false),
        Err(ChannelError::UnknownTransport(_))
    ));
}

#[tokio::test]
async fn test_no_connections_while_shutting_down() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (b, b_cp) = service_on(&network, "b", false).await;

    a.set_shutdown_flag(true);
    assert!(matches!(
        a.connect(b_cp.clone(), false),
        Err(ChannelError::ShuttingDown)
    ));
    a.set_shutdown_flag(false);

    // the accepting side refuses during shutdown as well
    b.set_shutdown_flag(true);
    let attempt = a.connect(b_cp, false).unwrap().await.unwrap();
    assert!(matches!(attempt, Err(ChannelError::ShuttingDown)));
    assert!(a.all_outgoing_channels().await.is_empty());
}

#[tokio::test]
async fn test_connecting_to_self_is_refused() {
    let network = VirtualNetwork::new();
    let (a, a_cp) = service_on(&network, "a", false).await;

    let attempt = a.connect(a_cp, false).unwrap().await.unwrap();
    assert!(matches!(attempt, Err(ChannelError::Handshake(_))));
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (_b, b_cp) = service_on(&network, "b", false).await;
    let (_c, c_cp) = service_on(&network, "c", false).await;

    a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    let listener = Arc::new(RecordingListener::default());
    a.add_channel_lifecycle_listener(listener.clone()).await;

    let to_c = a.connect(c_cp, false).unwrap().await.unwrap().unwrap();
    assert!(a.close_outgoing_channel(&to_c).await);
    // second close is a no-op
    assert!(!a.close_outgoing_channel(&to_c).await);
    settle().await;

    assert_eq!(listener.events(), vec!["initial:1", "up:c", "down:c"]);
}

#[tokio::test]
async fn test_unknown_channel_id_gives_closed_or_broken() {
    let service = MessageChannelService::new(node("a", false), fast_config());
    let request = NetworkRequest::new("echo", Bytes::new(), None, None);
    let response = service.send_request_to_channel_id(request, "missing").await;
    assert_eq!(response.result_code, ResultCode::ChannelClosedOrBroken);
}

#[tokio::test]
async fn test_closed_channel_id_gives_closed_or_broken() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (_b, b_cp) = service_on(&network, "b", false).await;

    let channel = a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    let channel_id = channel.channel_id().to_string();
    assert!(a.close_outgoing_channel(&channel).await);

    let request = NetworkRequest::new("echo", Bytes::new(), None, None);
    let response = a.send_request_to_channel_id(request, &channel_id).await;
    assert_eq!(response.result_code, ResultCode::ChannelClosedOrBroken);
}

#[tokio::test]
async fn test_request_on_lost_link_unregisters_channel_once() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (_b, b_cp) = service_on(&network, "b", false).await;
    let listener = Arc::new(RecordingListener::default());
    a.add_channel_lifecycle_listener(listener.clone()).await;

    let channel = a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    network.simulate_link_failure(&NodeId::new("a").unwrap(), &NodeId::new("b").unwrap());

    let request = NetworkRequest::new("echo", Bytes::new(), None, None);
    let response = a.send_request(request, &channel).await;
    assert_eq!(response.result_code, ResultCode::ChannelClosedOrBroken);
    settle().await;

    assert_eq!(channel.state(), crate::ChannelState::Broken);
    assert!(a.all_outgoing_channels().await.is_empty());
    assert!(a.health_state(channel.channel_id()).is_none());
    assert_eq!(listener.events(), vec!["initial:0", "up:b", "down:b"]);
}

#[tokio::test]
async fn test_refused_request_unregisters_channel_once() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (_b, b_cp) = service_on(&network, "b", false).await;
    let listener = Arc::new(RecordingListener::default());
    a.add_channel_lifecycle_listener(listener.clone()).await;

    let channel = a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    network.set_fault(&NodeId::new("b").unwrap(), VirtualFault::Refuse);

    for _ in 0..2 {
        let request = NetworkRequest::new("echo", Bytes::new(), None, None);
        let response = a.send_request(request, &channel).await;
        assert_eq!(response.result_code, ResultCode::ChannelClosedOrBroken);
    }
    settle().await;

    assert_eq!(channel.state(), crate::ChannelState::Broken);
    assert!(a.all_outgoing_channels().await.is_empty());
    assert_eq!(listener.events(), vec!["initial:0", "up:b", "down:b"]);
}

#[tokio::test]
async fn test_silent_remote_times_out() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (_b, b_cp) = service_on(&network, "b", false).await;

    let channel = a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    network.set_fault(&NodeId::new("b").unwrap(), VirtualFault::Swallow);

    let request = NetworkRequest::new("echo", Bytes::new(), None, None);
    let response = a.send_request(request, &channel).await;
    assert_eq!(response.result_code, ResultCode::Timeout);
}

#[tokio::test]
async fn test_health_check_failures_mark_channel_broken() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (_b, b_cp) = service_on(&network, "b", false).await;
    let listener = Arc::new(RecordingListener::default());
    a.add_channel_lifecycle_listener(listener.clone()).await;

    let channel = a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    assert_eq!(run_checks(&a).await, vec![HealthCheckOutcome::Passed]);

    network.set_fault(&NodeId::new("b").unwrap(), VirtualFault::Swallow);
    for expected in 1..=2 {
        assert_eq!(
            run_checks(&a).await,
            vec![HealthCheckOutcome::Failed {
                consecutive_failures: expected,
                marked_broken: false
            }]
        );
    }
    assert_eq!(
        run_checks(&a).await,
        vec![HealthCheckOutcome::Failed {
            consecutive_failures: 3,
            marked_broken: true
        }]
    );
    settle().await;

    assert_eq!(channel.state(), crate::ChannelState::Broken);
    assert!(a.all_outgoing_channels().await.is_empty());
    assert!(a.health_state(channel.channel_id()).is_none());
    assert_eq!(listener.events(), vec!["initial:0", "up:b", "down:b"]);
    // nothing left to check
    assert!(run_checks(&a).await.is_empty());
}

#[tokio::test]
async fn test_single_success_resets_failures() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (_b, b_cp) = service_on(&network, "b", false).await;
    let b_id = NodeId::new("b").unwrap();

    let channel = a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    let state = a.health_state(channel.channel_id()).unwrap();

    network.set_fault(&b_id, VirtualFault::Refuse);
    run_checks(&a).await;
    run_checks(&a).await;
    assert_eq!(state.consecutive_failures(), 2);

    network.set_fault(&b_id, VirtualFault::Healthy);
    assert_eq!(run_checks(&a).await, vec![HealthCheckOutcome::Passed]);
    assert_eq!(state.consecutive_failures(), 0);

    network.set_fault(&b_id, VirtualFault::Refuse);
    run_checks(&a).await;
    assert_eq!(state.consecutive_failures(), 1);
    assert!(channel.is_ready_to_use());
}

#[tokio::test]
async fn test_periodic_checks_detect_dead_channel() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (_b, b_cp) = service_on(&network, "b", false).await;

    a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    network.set_fault(&NodeId::new("b").unwrap(), VirtualFault::Refuse);
    let task = a.start_periodic_health_checks();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(a.all_outgoing_channels().await.is_empty());

    a.set_shutdown_flag(true);
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_incoming_requests_for_other_nodes() {
    let request_for_c = || {
        NetworkRequest::new(
            "echo",
            Bytes::new(),
            Some(NodeId::new("a").unwrap()),
            Some(NodeId::new("c").unwrap()),
        )
    };
    let hop = NodeId::new("a").unwrap();

    let leaf = MessageChannelService::new(node("b", false), fast_config());
    let response = leaf.handle_incoming_request(request_for_c(), hop.clone()).await;
    assert_eq!(
        response.result_code,
        ResultCode::NoRouteToDestinationWhileForwarding
    );

    let relay = MessageChannelService::new(node("b", true), fast_config());
    let response = relay.handle_incoming_request(request_for_c(), hop.clone()).await;
    assert_eq!(
        response.result_code,
        ResultCode::NoRouteToDestinationWhileForwarding
    );

    let forwarder: Arc<dyn ForwardingService> = Arc::new(FixedForwarder);
    relay.set_forwarding_service(&forwarder);
    let response = relay.handle_incoming_request(request_for_c(), hop).await;
    assert!(response.is_success());
    assert_eq!(response.content, Bytes::from_static(b"forwarded"));
    assert_eq!(relay.traffic_stats()["echo"].forwarded, 1);
}

#[tokio::test]
async fn test_local_request_without_handler() {
    let service = MessageChannelService::new(node("b", false), fast_config());
    let request = NetworkRequest::new("unknown", Bytes::new(), None, None);
    let response = service
        .handle_incoming_request(request, NodeId::new("a").unwrap())
        .await;
    assert_eq!(response.result_code, ResultCode::NoMatchingHandler);
    assert_eq!(response.sender.as_ref().map(NodeId::as_str), Some("b"));
    assert_eq!(service.traffic_stats()["unknown"].delivered, 1);
}

#[tokio::test]
async fn test_remote_closed_answers_count_as_failures() {
    let network = VirtualNetwork::new();
    let (a, _) = service_on(&network, "a", false).await;
    let (b, b_cp) = service_on(&network, "b", false).await;

    let channel = a.connect(b_cp, false).unwrap().await.unwrap().unwrap();
    b.register_request_handler(MESSAGE_TYPE_HEALTH_CHECK, Arc::new(GoneRemote));

    for expected in 1..=2 {
        assert_eq!(
            run_checks(&a).await,
            vec![HealthCheckOutcome::Failed {
                consecutive_failures: expected,
                marked_broken: false
            }]
        );
    }
    assert_eq!(
        run_checks(&a).await,
        vec![HealthCheckOutcome::Failed {
            consecutive_failures: 3,
            marked_broken: true
        }]
    );
    settle().await;

    assert_eq!(channel.state(), crate::ChannelState::Broken);
    assert!(a.all_outgoing_channels().await.is_empty());
}
