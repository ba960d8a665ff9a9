//! Channel error types.

use thiserror::Error;

/// Errors raised by channels, transports and the channel service
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// The service is shutting down and accepts no new connections
    #[error("channel service is shutting down")]
    ShuttingDown,

    /// No transport provider is registered under this id
    #[error("no transport provider registered for '{0}'")]
    UnknownTransport(String),

    /// A transport provider with this id is already registered
    #[error("transport provider '{0}' is already registered")]
    DuplicateTransport(String),

    /// The node information exchange failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The channel was closed
    #[error("channel {0} is closed")]
    Closed(String),

    /// The channel lost its connection
    #[error("channel {0} is broken: {1}")]
    Broken(String, String),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Encoding or framing failure
    #[error("wire error: {0}")]
    Wire(String),
}

impl From<mesh_wire::WireError> for ChannelError {
    fn from(err: mesh_wire::WireError) -> Self {
        ChannelError::Wire(err.to_string())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Transport(err.to_string())
    }
}
