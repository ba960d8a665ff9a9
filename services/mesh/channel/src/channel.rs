//! Message channel abstraction and its lifecycle state machine.

use crate::ChannelError;
use async_trait::async_trait;
use mesh_wire::{NetworkRequest, NetworkResponse, NodeInfo};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// Lifecycle state of a message channel.
///
/// `Connecting -> Established -> (Closing -> Closed | Broken)`; `Closed` and `Broken` are
/// terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Handshake in progress
    Connecting = 0,
    /// Ready to carry requests
    Established = 1,
    /// Graceful close in progress
    Closing = 2,
    /// Closed gracefully
    Closed = 3,
    /// Connection lost or health checks failed
    Broken = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Established,
            2 => ChannelState::Closing,
            3 => ChannelState::Closed,
            _ => ChannelState::Broken,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Broken)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Established => "ESTABLISHED",
            ChannelState::Closing => "CLOSING",
            ChannelState::Closed => "CLOSED",
            ChannelState::Broken => "BROKEN",
        };
        f.write_str(s)
    }
}

/// Transport-independent part of a channel: identity, state and mirror association
#[derive(Debug)]
pub struct ChannelCore {
    channel_id: String,
    remote_node_info: NodeInfo,
    initiated_by_remote: bool,
    state: AtomicU8,
    associated_mirror_channel_id: RwLock<Option<String>>,
    closed_because_mirror_closed: AtomicBool,
}

impl ChannelCore {
    /// Create a channel core in `Connecting` state
    pub fn new(
        channel_id: impl Into<String>,
        remote_node_info: NodeInfo,
        initiated_by_remote: bool,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            remote_node_info,
            initiated_by_remote,
            state: AtomicU8::new(ChannelState::Connecting as u8),
            associated_mirror_channel_id: RwLock::new(None),
            closed_because_mirror_closed: AtomicBool::new(false),
        }
    }

    /// Generate a fresh channel id
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Channel id; also the connection id of the topology link it backs
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Identity of the node at the other end
    pub fn remote_node_info(&self) -> &NodeInfo {
        &self.remote_node_info
    }

    /// Whether the other side opened this channel (duplex mirror)
    pub fn initiated_by_remote(&self) -> bool {
        self.initiated_by_remote
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Id of the paired channel in the opposite direction, if any
    pub fn associated_mirror_channel_id(&self) -> Option<String> {
        self.associated_mirror_channel_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Pair this channel with its mirror
    pub fn set_associated_mirror_channel_id(&self, mirror_id: Option<String>) {
        match self.associated_mirror_channel_id.write() {
            Ok(mut id) => *id = mirror_id,
            Err(poisoned) => *poisoned.into_inner() = mirror_id,
        }
    }

    /// Whether the close was caused by the mirror channel closing
    pub fn closed_because_mirror_closed(&self) -> bool {
        self.closed_because_mirror_closed.load(Ordering::Acquire)
    }

    /// Record that the mirror channel closed
    pub fn mark_closed_because_mirror_closed(&self) {
        self.closed_because_mirror_closed
            .store(true, Ordering::Release);
    }

    /// `Connecting -> Established`; returns whether the transition happened
    pub fn mark_established(&self) -> bool {
        self.transition(ChannelState::Connecting, ChannelState::Established)
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move into `Broken` unless already terminal; returns whether the transition happened
    fn transition_to_broken(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ChannelState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ChannelState::Broken as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// One point-to-point connection to a remote node.
///
/// Transports implement [`MessageChannel::send_raw_request`] and optionally the close/broken
/// hooks; state transitions are provided.
#[async_trait]
pub trait MessageChannel: Send + Sync + fmt::Debug {
    /// Transport-independent channel state
    fn core(&self) -> &ChannelCore;

    /// Send a request and wait for the matching response
    async fn send_raw_request(
        &self,
        request: NetworkRequest,
    ) -> Result<NetworkResponse, ChannelError>;

    /// Transport hook run once when the channel is closed gracefully
    fn on_close(&self) {}

    /// Transport hook run once when the channel is marked broken
    fn on_broken(&self) {}

    /// Channel id
    fn channel_id(&self) -> &str {
        self.core().channel_id()
    }

    /// Identity of the remote node
    fn remote_node_info(&self) -> &NodeInfo {
        self.core().remote_node_info()
    }

    /// Current state
    fn state(&self) -> ChannelState {
        self.core().state()
    }

    /// Whether requests can be sent
    fn is_ready_to_use(&self) -> bool {
        self.state() == ChannelState::Established
    }

    /// Close gracefully; returns `false` if the channel was not established
    fn close(&self) -> bool {
        let core = self.core();
        if !core.transition(ChannelState::Established, ChannelState::Closing) {
            return false;
        }
        self.on_close();
        core.set_state(ChannelState::Closed);
        true
    }

    /// Mark as broken; returns `false` if the channel was already closed or broken
    fn mark_as_broken(&self) -> bool {
        if !self.core().transition_to_broken() {
            return false;
        }
        self.on_broken();
        true
    }
}

/// Receives reports of channels whose connection was lost
pub trait BrokenChannelListener: Send + Sync {
    /// The transport detected that the channel's connection is gone
    fn on_channel_broken(&self, channel: Arc<dyn MessageChannel>);
}

/// Short channel description for log output
pub fn describe(channel: &dyn MessageChannel) -> String {
    format!(
        "{} to {} ({})",
        channel.channel_id(),
        channel.remote_node_info().log_description(),
        channel.state()
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use mesh_wire::NodeId;
    use std::sync::atomic::AtomicUsize;

    /// Channel answering every request with an empty success response
    #[derive(Debug)]
    pub struct LoopbackChannel {
        core: ChannelCore,
        pub close_hooks: AtomicUsize,
        pub broken_hooks: AtomicUsize,
    }

    impl LoopbackChannel {
        pub fn new(remote: &str) -> Self {
            let info = NodeInfo::new(NodeId::new(remote).unwrap(), remote, false);
            Self {
                core: ChannelCore::new(ChannelCore::generate_id(), info, false),
                close_hooks: AtomicUsize::new(0),
                broken_hooks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageChannel for LoopbackChannel {
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
            Ok(NetworkResponse::success(&request, request.content.clone()))
        }

        fn on_close(&self) {
            self.close_hooks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_broken(&self) {
            self.broken_hooks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::LoopbackChannel;
    use super::*;

    #[test]
    fn test_close_happens_once() {
        let channel = LoopbackChannel::new("remote");
        assert_eq!(channel.state(), ChannelState::Connecting);
        // not established yet
        assert!(!channel.close());

        assert!(channel.core().mark_established());
        assert!(channel.is_ready_to_use());
        assert!(channel.close());
        assert!(!channel.close());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.close_hooks.load(Ordering::SeqCst), 1);

        // closed is terminal
        assert!(!channel.mark_as_broken());
        assert_eq!(channel.broken_hooks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mark_broken_is_idempotent() {
        let channel = LoopbackChannel::new("remote");
        channel.core().mark_established();

        assert!(channel.mark_as_broken());
        assert!(!channel.mark_as_broken());
        assert!(!channel.close());
        assert_eq!(channel.state(), ChannelState::Broken);
        assert_eq!(channel.broken_hooks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mirror_association() {
        let channel = LoopbackChannel::new("remote");
        assert_eq!(channel.core().associated_mirror_channel_id(), None);
        channel
            .core()
            .set_associated_mirror_channel_id(Some("mirror".into()));
        assert_eq!(
            channel.core().associated_mirror_channel_id().as_deref(),
            Some("mirror")
        );
        assert!(!channel.core().closed_because_mirror_closed());
        channel.core().mark_closed_because_mirror_closed();
        assert!(channel.core().closed_because_mirror_closed());
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_requests() {
        let channel = LoopbackChannel::new("remote");
        channel.core().mark_established();
        let request = NetworkRequest::new("t", bytes::Bytes::new(), None, None);
        assert!(channel.send_raw_request(request.clone()).await.is_ok());

        channel.close();
        assert!(matches!(
            channel.send_raw_request(request).await,
            Err(ChannelError::Closed(_))
        ));
    }
}
