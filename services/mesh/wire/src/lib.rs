//! Value types and wire encoding for the overlay network.
//!
//! This crate holds everything two nodes must agree on byte-for-byte: node identities,
//! links and link-state advertisements, request/response envelopes, contact points, the
//! CBOR payload codec, and the length-prefixed framing used by stream transports.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len (BE)   | length of bytes that follow|
//! +----------------------+----------------------------+
//! | CBOR ChannelFrame    | hello / request / response |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod contact;
pub mod error;
pub mod frame;
pub mod message;
pub mod node;
pub mod topology;

// Re-export main types
pub use codec::{decode_payload, encode_payload};
pub use contact::ContactPoint;
pub use error::WireError;
pub use frame::{encode_frame, ChannelFrame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use message::{
    NetworkRequest, NetworkResponse, RequestMetadata, ResultCode, MESSAGE_TYPE_HEALTH_CHECK,
    MESSAGE_TYPE_LSA,
};
pub use node::{NodeId, NodeInfo};
pub use topology::{
    Link, LinkStateAdvertisement, LsaBatch, LsaPayload, LsaReason, DEFAULT_LINK_WEIGHT,
};
