//! TCP transport.
//!
//! One TCP connection carries the connecting side's channel and, with duplex, the accepting
//! side's mirror channel. Frames are length-prefixed CBOR ([`mesh_wire::ChannelFrame`]); requests
//! are correlated with responses by request id, so both directions can have many requests in
//! flight.

use super::TransportProvider;
use crate::{
    describe, BrokenChannelListener, ChannelCore, ChannelError, ConnectionFilter, EndpointHandler,
    MessageChannel,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use mesh_wire::{
    encode_frame, ChannelFrame, ContactPoint, FrameDecoder, NetworkRequest, NetworkResponse,
    NodeId, NodeInfo, DEFAULT_MAX_FRAME_SIZE,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Transport id of the TCP transport
pub const TCP_TRANSPORT_ID: &str = "tcp";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 8 * 1024;

enum WriterCommand {
    Data(Bytes),
    Shutdown,
}

/// Write side and in-flight requests of one TCP connection
struct Connection {
    writer: mpsc::UnboundedSender<WriterCommand>,
    pending: DashMap<String, oneshot::Sender<NetworkResponse>>,
    max_frame_size: usize,
}

impl Connection {
    fn spawn(mut write_half: OwnedWriteHalf, max_frame_size: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Data(data) => {
                        if let Err(e) = write_half.write_all(&data).await {
                            debug!("Write failed, stopping connection writer: {}", e);
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
        });
        Arc::new(Self {
            writer: tx,
            pending: DashMap::new(),
            max_frame_size,
        })
    }

    fn send_frame(&self, frame: &ChannelFrame) -> Result<(), ChannelError> {
        let data = encode_frame(frame, self.max_frame_size)?;
        self.writer
            .send(WriterCommand::Data(data))
            .map_err(|_| ChannelError::Transport("connection writer stopped".to_string()))
    }

    fn shutdown(&self) {
        let _ = self.writer.send(WriterCommand::Shutdown);
    }

    fn complete(&self, response: NetworkResponse) {
        match self.pending.remove(&response.request_id) {
            Some((_, tx)) => {
                let _ = tx.send(response);
            }
            None => debug!(
                "Dropping response to unknown or expired request {}",
                response.request_id
            ),
        }
    }

    /// Drop all waiters; their receivers observe the connection loss
    fn fail_pending(&self) {
        self.pending.clear();
    }
}

/// Removes the pending entry when the waiting request completes or is cancelled
struct PendingGuard<'a> {
    connection: &'a Connection,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.connection.pending.remove(&self.request_id);
    }
}

/// Channel carried by a TCP connection
pub struct TcpChannel {
    core: ChannelCore,
    connection: Arc<Connection>,
    peer: SocketAddr,
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("core", &self.core)
            .field("peer", &self.peer)
            .finish()
    }
}

impl TcpChannel {
    fn new(core: ChannelCore, connection: Arc<Connection>, peer: SocketAddr) -> Self {
        Self {
            core,
            connection,
            peer,
        }
    }

    /// Address of the remote socket
    pub fn peer_address(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl MessageChannel for TcpChannel {
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

        let (tx, rx) = oneshot::channel();
        let request_id = request.request_id.clone();
        self.connection.pending.insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            connection: &self.connection,
            request_id,
        };

        self.connection
            .send_frame(&ChannelFrame::Request(request))
            .map_err(|e| ChannelError::Broken(self.channel_id().to_string(), e.to_string()))?;

        rx.await.map_err(|_| {
            ChannelError::Broken(
                self.channel_id().to_string(),
                "connection lost while waiting for response".to_string(),
            )
        })
    }

    fn on_close(&self) {
        let _ = self.connection.send_frame(&ChannelFrame::Close {
            channel_id: self.channel_id().to_string(),
        });
        self.connection.shutdown();
    }

    fn on_broken(&self) {
        self.connection.shutdown();
    }
}

/// How a connection's read loop ended
enum ReadEnd {
    /// The remote side sent a close frame before disconnecting
    RemoteClosed,
    /// The connection dropped or carried garbage
    Lost(String),
}

struct FrameReader {
    read_half: OwnedReadHalf,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl FrameReader {
    fn new(read_half: OwnedReadHalf, max_frame_size: usize) -> Self {
        Self {
            read_half,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
        }
    }

    /// Next frame, `Ok(None)` on a clean end of stream
    async fn next_frame(&mut self) -> Result<Option<ChannelFrame>, ChannelError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            if self.read_half.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn expect_frame(&mut self, limit: Duration) -> Result<ChannelFrame, ChannelError> {
        match timeout(limit, self.next_frame()).await {
            Ok(Ok(Some(frame))) => Ok(frame),
            Ok(Ok(None)) => Err(ChannelError::Handshake(
                "connection closed during handshake".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ChannelError::Handshake(format!(
                "no handshake frame within {limit:?}"
            ))),
        }
    }

    /// Dispatch frames until the connection ends
    async fn run(
        mut self,
        connection: Arc<Connection>,
        remote_id: NodeId,
        endpoint: Arc<dyn EndpointHandler>,
    ) -> ReadEnd {
        let mut remote_closed = false;
        let end = loop {
            let frame = match self.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) if remote_closed => break ReadEnd::RemoteClosed,
                Ok(None) => break ReadEnd::Lost("connection reset by peer".to_string()),
                Err(e) => break ReadEnd::Lost(e.to_string()),
            };

            match frame {
                ChannelFrame::Request(request) => {
                    let connection = connection.clone();
                    let endpoint = endpoint.clone();
                    let remote_id = remote_id.clone();
                    tokio::spawn(async move {
                        let response = endpoint.on_raw_request_received(request, remote_id).await;
                        if let Err(e) = connection.send_frame(&ChannelFrame::Response(response)) {
                            debug!("Could not send response: {}", e);
                        }
                    });
                }
                ChannelFrame::Response(response) => connection.complete(response),
                ChannelFrame::Close { channel_id } => {
                    debug!("Remote {} closed channel {}", remote_id, channel_id);
                    remote_closed = true;
                    endpoint.on_inbound_channel_closing(&channel_id);
                }
                other => {
                    break ReadEnd::Lost(format!("unexpected {} frame", other.kind()));
                }
            }
        };
        connection.fail_pending();
        end
    }
}

/// TCP transport provider
pub struct TcpTransportProvider {
    max_frame_size: usize,
    handshake_timeout: Duration,
    servers: DashMap<String, JoinHandle<()>>,
}

impl Default for TcpTransportProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransportProvider {
    /// Create a provider with default limits
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            servers: DashMap::new(),
        }
    }

    /// Override the maximum frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Override the handshake timeout
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

#[async_trait]
impl TransportProvider for TcpTransportProvider {
    fn transport_id(&self) -> &str {
        TCP_TRANSPORT_ID
    }

    async fn connect(
        &self,
        contact_point: &ContactPoint,
        local: &NodeInfo,
        allow_duplex: bool,
        endpoint: Arc<dyn EndpointHandler>,
        broken_listener: Arc<dyn BrokenChannelListener>,
    ) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        let stream = timeout(
            self.handshake_timeout,
            TcpStream::connect(contact_point.socket_address()),
        )
        .await
        .map_err(|_| ChannelError::Transport(format!("connect to {} timed out", contact_point)))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, self.max_frame_size);

        let channel_id = ChannelCore::generate_id();
        let hello = encode_frame(
            &ChannelFrame::Hello {
                node_info: local.clone(),
                channel_id: channel_id.clone(),
                allow_duplex,
            },
            self.max_frame_size,
        )?;
        timeout(self.handshake_timeout, write_half.write_all(&hello))
            .await
            .map_err(|_| {
                ChannelError::Handshake(format!("sending hello to {} timed out", contact_point))
            })??;

        let (remote, mirror_channel_id) = match reader.expect_frame(self.handshake_timeout).await? {
            ChannelFrame::HelloAck {
                node_info,
                mirror_channel_id,
            } => (node_info, mirror_channel_id),
            other => {
                return Err(ChannelError::Handshake(format!(
                    "expected hello-ack, got {}",
                    other.kind()
                )))
            }
        };
        endpoint.exchange_node_information(&remote)?;

        let connection = Connection::spawn(write_half, self.max_frame_size);
        let channel = Arc::new(TcpChannel::new(
            ChannelCore::new(channel_id, remote.clone(), false),
            connection.clone(),
            peer,
        ));
        channel
            .core()
            .set_associated_mirror_channel_id(mirror_channel_id);
        channel.core().mark_established();

        let weak: Weak<TcpChannel> = Arc::downgrade(&channel);
        tokio::spawn(async move {
            let end = reader.run(connection, remote.node_id.clone(), endpoint).await;
            let Some(channel) = weak.upgrade() else {
                return;
            };
            match end {
                ReadEnd::Lost(reason) if channel.is_ready_to_use() => {
                    warn!(
                        "Connection of channel {} lost: {}",
                        describe(channel.as_ref()),
                        reason
                    );
                    broken_listener.on_channel_broken(channel);
                }
                _ => debug!("Connection of channel {} ended", channel.channel_id()),
            }
        });

        Ok(channel)
    }

    async fn start_server(
        &self,
        contact_point: &ContactPoint,
        endpoint: Arc<dyn EndpointHandler>,
        filter: Arc<ConnectionFilter>,
    ) -> Result<ContactPoint, ChannelError> {
        let listener = TcpListener::bind(contact_point.socket_address()).await?;
        let local_addr = listener.local_addr()?;
        let bound = ContactPoint::new(
            TCP_TRANSPORT_ID,
            contact_point.host.clone(),
            local_addr.port(),
        );

        let max_frame_size = self.max_frame_size;
        let handshake_timeout = self.handshake_timeout;
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection on {}: {}", local_addr, e);
                        continue;
                    }
                };
                if !filter.is_allowed(&peer.ip()) {
                    info!("Rejected connection from {} by connection filter", peer);
                    continue;
                }
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        serve_inbound(stream, peer, endpoint, max_frame_size, handshake_timeout)
                            .await
                    {
                        debug!("Inbound connection from {} failed: {}", peer, e);
                    }
                });
            }
        });

        self.servers.insert(bound.socket_address(), task);
        Ok(bound)
    }

    async fn stop_server(&self, contact_point: &ContactPoint) -> Result<(), ChannelError> {
        match self.servers.remove(&contact_point.socket_address()) {
            Some((_, task)) => {
                task.abort();
                Ok(())
            }
            None => Err(ChannelError::Transport(format!(
                "no server at {}",
                contact_point
            ))),
        }
    }
}

/// Accepting side of one connection: handshake, optional mirror channel, then the read loop
async fn serve_inbound(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<dyn EndpointHandler>,
    max_frame_size: usize,
    handshake_timeout: Duration,
) -> Result<(), ChannelError> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, max_frame_size);

    let (remote, inbound_channel_id, allow_duplex) =
        match reader.expect_frame(handshake_timeout).await? {
            ChannelFrame::Hello {
                node_info,
                channel_id,
                allow_duplex,
            } => (node_info, channel_id, allow_duplex),
            other => {
                return Err(ChannelError::Handshake(format!(
                    "expected hello, got {}",
                    other.kind()
                )))
            }
        };
    // dropping the socket refuses the connection
    let local = endpoint.exchange_node_information(&remote)?;

    let connection = Connection::spawn(write_half, max_frame_size);
    let mirror = allow_duplex.then(|| {
        let mirror = Arc::new(TcpChannel::new(
            ChannelCore::new(ChannelCore::generate_id(), remote.clone(), true),
            connection.clone(),
            peer,
        ));
        mirror
            .core()
            .set_associated_mirror_channel_id(Some(inbound_channel_id.clone()));
        mirror.core().mark_established();
        mirror
    });

    connection.send_frame(&ChannelFrame::HelloAck {
        node_info: local,
        mirror_channel_id: mirror.as_ref().map(|m| m.channel_id().to_string()),
    })?;
    if let Some(mirror) = mirror {
        endpoint.on_remote_initiated_channel_established(mirror).await;
    }

    let end = reader
        .run(connection, remote.node_id.clone(), endpoint.clone())
        .await;
    if let ReadEnd::Lost(reason) = end {
        debug!(
            "Inbound channel {} from {} ended: {}",
            inbound_channel_id, peer, reason
        );
        endpoint.on_inbound_channel_closing(&inbound_channel_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NetworkRequestHandler;
    use crate::{ChannelState, CommunicationConfig, MessageChannelService};
    use mesh_wire::ResultCode;
    use std::net::IpAddr;

    struct Echo;

    #[async_trait]
    impl NetworkRequestHandler for Echo {
        async fn handle_request(
            &self,
            request: &NetworkRequest,
            _last_hop: &NodeId,
        ) -> anyhow::Result<NetworkResponse> {
            Ok(NetworkResponse::success(request, request.content.clone()))
        }
    }

    fn node(id: &str) -> NodeInfo {
        NodeInfo::new(NodeId::new(id).unwrap(), id.to_uppercase(), false)
    }

    async fn tcp_service(id: &str) -> (Arc<MessageChannelService>, ContactPoint) {
        let service = MessageChannelService::new(node(id), CommunicationConfig::default());
        service
            .add_transport_provider(Arc::new(TcpTransportProvider::new()))
            .unwrap();
        service.register_request_handler("echo", Arc::new(Echo));
        let bound = service
            .start_server(&ContactPoint::new(TCP_TRANSPORT_ID, "127.0.0.1", 0))
            .await
            .unwrap();
        (service, bound)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_requests_in_both_directions() {
        let (a, _) = tcp_service("a").await;
        let (b, b_cp) = tcp_service("b").await;
        assert_ne!(b_cp.port, 0);

        let channel = a.connect(b_cp, true).unwrap().await.unwrap().unwrap();
        let request = NetworkRequest::new("echo", Bytes::from_static(b"ping"), None, None);
        let response = a.send_request(request, &channel).await;
        assert!(response.is_success());
        assert_eq!(response.content, Bytes::from_static(b"ping"));
        assert_eq!(response.sender.as_ref().map(NodeId::as_str), Some("b"));

        settle().await;
        let mirror = b.all_outgoing_channels().await.remove(0);
        assert_eq!(mirror.remote_node_info().node_id.as_str(), "a");
        let request = NetworkRequest::new("echo", Bytes::from_static(b"pong"), None, None);
        let response = b.send_request(request, &mirror).await;
        assert_eq!(response.content, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_close_reaches_mirror() {
        let (a, _) = tcp_service("a").await;
        let (b, b_cp) = tcp_service("b").await;

        let channel = a.connect(b_cp, true).unwrap().await.unwrap().unwrap();
        settle().await;
        assert_eq!(b.all_outgoing_channels().await.len(), 1);

        assert!(a.close_outgoing_channel(&channel).await);
        settle().await;
        assert!(b.all_outgoing_channels().await.is_empty());
        assert!(a.all_outgoing_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_filtered_peer_is_refused() {
        let (a, _) = tcp_service("a").await;
        let (b, b_cp) = tcp_service("b").await;
        b.connection_filter()
            .configure(Some(vec!["10.1.2.3".parse::<IpAddr>().unwrap()]));

        // the server drops the socket before the handshake
        let attempt = a.connect(b_cp, false).unwrap().await.unwrap();
        assert!(attempt.is_err());
        assert!(a.all_outgoing_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_silent_peer_fails_handshake() {
        // accepts the connection, then never reads or answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _held = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let a = MessageChannelService::new(node("a"), CommunicationConfig::default());
        a.add_transport_provider(Arc::new(
            TcpTransportProvider::new().with_handshake_timeout(Duration::from_millis(200)),
        ))
        .unwrap();

        let attempt = tokio::time::timeout(
            Duration::from_secs(5),
            a.connect(ContactPoint::new(TCP_TRANSPORT_ID, "127.0.0.1", port), false)
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(attempt.is_err());
        assert!(a.all_outgoing_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_connection_marks_channel_broken() {
        let (a, _) = tcp_service("a").await;

        // accept one connection, answer the handshake, then drop the socket
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half, DEFAULT_MAX_FRAME_SIZE);
            reader.expect_frame(Duration::from_secs(5)).await.unwrap();
            let ack = ChannelFrame::HelloAck {
                node_info: node("rogue"),
                mirror_channel_id: None,
            };
            let data = encode_frame(&ack, DEFAULT_MAX_FRAME_SIZE).unwrap();
            write_half.write_all(&data).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let channel = a
            .connect(ContactPoint::new(TCP_TRANSPORT_ID, "127.0.0.1", port), false)
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.all_outgoing_channels().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(channel.state(), ChannelState::Broken);
        assert!(a.all_outgoing_channels().await.is_empty());

        let request = NetworkRequest::new("echo", Bytes::new(), None, None);
        let response = a.send_request(request, &channel).await;
        assert_eq!(response.result_code, ResultCode::ChannelClosedOrBroken);
    }

    #[tokio::test]
    async fn test_stop_server() {
        let provider = TcpTransportProvider::new();
        let (service, _) = tcp_service("a").await;
        let bound = provider
            .start_server(
                &ContactPoint::new(TCP_TRANSPORT_ID, "127.0.0.1", 0),
                service.endpoint_handler(),
                Arc::new(ConnectionFilter::new()),
            )
            .await
            .unwrap();
        assert!(provider.stop_server(&bound).await.is_ok());
        assert!(provider.stop_server(&bound).await.is_err());
    }
}
