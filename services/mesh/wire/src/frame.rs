//! Length-prefixed framing for stream transports.
//!
//! Every frame is a big-endian `u32` body length followed by a CBOR-encoded [`ChannelFrame`].

use crate::codec::{decode_payload, encode_payload};
use crate::{NetworkRequest, NetworkResponse, NodeInfo, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Maximum frame size (16 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame length prefix size
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Messages exchanged on a stream connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelFrame {
    /// First frame sent by the connecting side
    Hello {
        /// Identity of the connecting node
        node_info: NodeInfo,
        /// Channel id chosen by the connecting side
        channel_id: String,
        /// Whether the accepting side should open a mirror channel
        allow_duplex: bool,
    },
    /// Reply of the accepting side
    HelloAck {
        /// Identity of the accepting node
        node_info: NodeInfo,
        /// Id of the accepting side's mirror channel, if one was created
        mirror_channel_id: Option<String>,
    },
    /// A request to be handled by the receiver
    Request(NetworkRequest),
    /// Response correlated by request id
    Response(NetworkResponse),
    /// Graceful close of the channel with the given id
    Close {
        /// Channel being closed
        channel_id: String,
    },
}

impl ChannelFrame {
    /// Frame kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelFrame::Hello { .. } => "hello",
            ChannelFrame::HelloAck { .. } => "hello-ack",
            ChannelFrame::Request(_) => "request",
            ChannelFrame::Response(_) => "response",
            ChannelFrame::Close { .. } => "close",
        }
    }
}

/// Encode a frame with its length prefix
pub fn encode_frame(frame: &ChannelFrame, max_frame_size: usize) -> Result<Bytes, WireError> {
    let body = encode_payload(frame)?;
    if body.len() > max_frame_size {
        return Err(WireError::Size(body.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Incremental frame decoder for parsing incoming bytes
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from the buffer; `Ok(None)` means more bytes are needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ChannelFrame>, WireError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at frame length
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + frame_len {
            buf.reserve(LENGTH_PREFIX_SIZE + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let body = buf.split_to(frame_len).freeze();
        decode_payload(&body).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
