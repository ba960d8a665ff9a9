//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// CBOR encoding failed
    #[error("cbor encode failed: {0}")]
    Encode(String),

    /// CBOR decoding failed
    #[error("cbor decode failed: {0}")]
    Decode(String),

    /// Malformed contact point string
    #[error("invalid contact point '{0}'")]
    ContactPoint(String),

    /// Empty or malformed node id
    #[error("invalid node id '{0}'")]
    NodeId(String),
}
