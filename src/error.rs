//! error types shared by the codec, transport and aggregation layers.

use std::time::Duration;

use thiserror::Error;

use crate::transport::{MessageTag, WireType};

/// result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// no message with the given tag arrived from a peer in time.
    #[error("timed out after {waited:?} waiting for {tag} message from process {process_id}")]
    Timeout {
        process_id: usize,
        tag: MessageTag,
        waited: Duration,
    },

    /// the receive scratch buffer could not be grown.
    #[error("failed to allocate {bytes} bytes for the receive buffer")]
    OutOfMemory { bytes: usize },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    /// a message was sent or received with an element type that does not match its tag.
    #[error("wire type mismatch for {tag} message: expected {expected}, got {actual}")]
    WireTypeMismatch {
        tag: MessageTag,
        expected: WireType,
        actual: WireType,
    },

    #[error("aggregation error: {0}")]
    Aggregation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
