//! Request and response envelopes exchanged over message channels.
//!
//! Application content is opaque bytes; only the envelope and metadata are interpreted by the
//! overlay. Typed content (LSAs, health-check tokens) is carried as CBOR inside `content`.

use crate::codec::{decode_payload, encode_payload};
use crate::{NodeId, WireError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message type of link-state advertisements
pub const MESSAGE_TYPE_LSA: &str = "lsa";
/// Message type of channel health probes
pub const MESSAGE_TYPE_HEALTH_CHECK: &str = "healthCheck";

/// Routing metadata attached to every request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Node that originated the request
    pub sender: Option<NodeId>,
    /// Destination node; `None` means "the node at the other end of the channel"
    pub final_recipient: Option<NodeId>,
    /// Number of forwarding hops taken so far
    #[serde(default)]
    pub hop_count: u32,
    /// Nodes that forwarded this request, in order
    #[serde(default)]
    pub trace: Vec<NodeId>,
}

/// A request travelling through the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Correlation id, preserved across forwarding hops
    pub request_id: String,
    /// Selects the request handler at the destination
    pub message_type: String,
    /// Opaque payload
    pub content: Bytes,
    /// Routing metadata
    pub metadata: RequestMetadata,
}

impl NetworkRequest {
    /// Create a request with a fresh id
    pub fn new(
        message_type: impl Into<String>,
        content: Bytes,
        sender: Option<NodeId>,
        final_recipient: Option<NodeId>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            content,
            metadata: RequestMetadata {
                sender,
                final_recipient,
                hop_count: 0,
                trace: Vec::new(),
            },
        }
    }

    /// Create a request whose content is a CBOR-encoded value
    pub fn with_payload<T: Serialize>(
        message_type: impl Into<String>,
        payload: &T,
        sender: Option<NodeId>,
        final_recipient: Option<NodeId>,
    ) -> Result<Self, WireError> {
        Ok(Self::new(
            message_type,
            encode_payload(payload)?,
            sender,
            final_recipient,
        ))
    }

    /// Decode the CBOR content
    pub fn deserialize_content<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        decode_payload(&self.content)
    }

    /// Whether this request must be handled by `local`
    pub fn is_destined_for(&self, local: &NodeId) -> bool {
        match &self.metadata.final_recipient {
            None => true,
            Some(recipient) => recipient == local,
        }
    }

    /// Copy of this request for the next hop; keeps the request id, bumps the hop count and
    /// records the forwarding node in the trace.
    pub fn forwarded_by(&self, forwarder: &NodeId) -> Self {
        let mut next = self.clone();
        next.metadata.hop_count += 1;
        next.metadata.trace.push(forwarder.clone());
        next
    }

    /// Size of the request content in bytes
    pub fn content_size(&self) -> usize {
        self.content.len()
    }
}

/// Outcome category of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// Handled successfully at the destination
    Success,
    /// The destination handler failed
    ExceptionAtDestination,
    /// A forwarding node had no route (or is not a relay)
    NoRouteToDestinationWhileForwarding,
    /// The originating node had no route
    NoRouteToDestinationAtSender,
    /// A forwarding hop failed or timed out
    ExceptionWhileForwarding,
    /// The channel closed or broke before a response arrived
    ChannelClosedOrBroken,
    /// No response arrived in time
    Timeout,
    /// No handler is registered for the message type
    NoMatchingHandler,
}

impl ResultCode {
    /// Whether this code means success
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::ExceptionAtDestination => "EXCEPTION_AT_DESTINATION",
            ResultCode::NoRouteToDestinationWhileForwarding => {
                "NO_ROUTE_TO_DESTINATION_WHILE_FORWARDING"
            }
            ResultCode::NoRouteToDestinationAtSender => "NO_ROUTE_TO_DESTINATION_AT_SENDER",
            ResultCode::ExceptionWhileForwarding => "EXCEPTION_WHILE_FORWARDING",
            ResultCode::ChannelClosedOrBroken => "CHANNEL_CLOSED_OR_BROKEN",
            ResultCode::Timeout => "TIMEOUT",
            ResultCode::NoMatchingHandler => "NO_MATCHING_HANDLER",
        };
        f.write_str(s)
    }
}

/// Response to a [`NetworkRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResponse {
    /// Id of the request this answers
    pub request_id: String,
    /// Outcome
    pub result_code: ResultCode,
    /// Opaque payload; for failures a UTF-8 error description
    pub content: Bytes,
    /// Node that produced the response
    pub sender: Option<NodeId>,
}

impl NetworkResponse {
    fn with_code(request_id: &str, result_code: ResultCode, content: Bytes) -> Self {
        Self {
            request_id: request_id.to_string(),
            result_code,
            content,
            sender: None,
        }
    }

    fn failure(request_id: &str, result_code: ResultCode, detail: impl fmt::Display) -> Self {
        Self::with_code(request_id, result_code, Bytes::from(detail.to_string()))
    }

    /// Successful response carrying raw content
    pub fn success(request: &NetworkRequest, content: Bytes) -> Self {
        Self::with_code(&request.request_id, ResultCode::Success, content)
    }

    /// Successful response carrying a CBOR-encoded value
    pub fn success_with_payload<T: Serialize>(
        request: &NetworkRequest,
        payload: &T,
    ) -> Result<Self, WireError> {
        Ok(Self::success(request, encode_payload(payload)?))
    }

    /// The destination's handler failed
    pub fn exception_at_destination(request: &NetworkRequest, detail: impl fmt::Display) -> Self {
        Self::failure(&request.request_id, ResultCode::ExceptionAtDestination, detail)
    }

    /// A relay could not find the next hop, or the node refuses to relay
    pub fn no_route_while_forwarding(request: &NetworkRequest, at: &NodeId) -> Self {
        Self::failure(
            &request.request_id,
            ResultCode::NoRouteToDestinationWhileForwarding,
            format_args!("no route to destination at {at}"),
        )
    }

    /// The originating node has no route to the recipient
    pub fn no_route_at_sender(request: &NetworkRequest) -> Self {
        Self::failure(
            &request.request_id,
            ResultCode::NoRouteToDestinationAtSender,
            "no route to destination",
        )
    }

    /// Forwarding over the next hop failed
    pub fn exception_while_forwarding(request: &NetworkRequest, detail: impl fmt::Display) -> Self {
        Self::failure(&request.request_id, ResultCode::ExceptionWhileForwarding, detail)
    }

    /// The channel closed or broke before the response arrived
    pub fn channel_closed_or_broken(request: &NetworkRequest, channel_id: &str) -> Self {
        Self::failure(
            &request.request_id,
            ResultCode::ChannelClosedOrBroken,
            format_args!("channel {channel_id} closed or broken"),
        )
    }

    /// No response within the configured timeout
    pub fn timeout(request: &NetworkRequest) -> Self {
        Self::failure(&request.request_id, ResultCode::Timeout, "request timed out")
    }

    /// No handler registered for the request's message type
    pub fn no_matching_handler(request: &NetworkRequest) -> Self {
        Self::failure(
            &request.request_id,
            ResultCode::NoMatchingHandler,
            format_args!("no handler for message type '{}'", request.message_type),
        )
    }

    /// Set the responding node
    pub fn from_sender(mut self, sender: NodeId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Whether the result code is [`ResultCode::Success`]
    pub fn is_success(&self) -> bool {
        self.result_code.is_success()
    }

    /// Decode CBOR content of a successful response
    pub fn deserialize_content<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        decode_payload(&self.content)
    }

    /// Failure detail, lossily decoded as UTF-8
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}
