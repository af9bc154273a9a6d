//! Error types for shardstore.
//!
//! Errors are split by layer so callers can decide what to do with them:
//! protocol errors close the connection, store/tag/routing errors become
//! error responses on the wire, I/O errors tear the connection down.

use thiserror::Error;

use crate::protocol::ShardId;

/// Malformed input on a framed stream. The stream cannot be trusted after one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload or field shorter than declared.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Opcode byte does not name a message of the expected class.
    #[error("unknown opcode byte {byte:#04x} for {class} message")]
    UnknownOpcode {
        byte: u8,
        class: crate::protocol::MessageClass,
    },

    /// Field vector does not match the opcode's layout.
    #[error("opcode {opcode:?} takes {expected} fields, got {actual}")]
    WrongFieldCount {
        opcode: crate::protocol::OpCode,
        expected: usize,
        actual: usize,
    },

    /// RemoteNode field is not a 4-byte shard id.
    #[error("remote node field must be 4 bytes, got {0}")]
    InvalidRemoteNode(usize),

    /// Frame length field smaller than the length field itself.
    #[error("invalid frame length {0}")]
    InvalidFrameLength(u32),

    /// Frame length field above the configured maximum.
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },
}

/// Object store failures. The `Display` text is what clients see.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("allocation of {requested} bytes exceeds capacity ({used}/{max} used)")]
    CapacityExceeded {
        requested: usize,
        used: usize,
        max: usize,
    },

    #[error("object {0} already exists")]
    KeyExists(String),

    #[error("object {0} not found")]
    NotFound(String),

    #[error("object {0} is committed and cannot be modified")]
    Immutable(String),

    #[error("write of {len} bytes at offset {offset} is outside object {key} of size {size}")]
    OutOfBounds {
        key: String,
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// Tag pool failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("too many outstanding remote requests (pool of {0} exhausted)")]
    PoolExhausted(usize),

    #[error("tag {0} is not outstanding")]
    NotOutstanding(u32),

    #[error("tag {tag} outside pool range 0..{capacity}")]
    OutOfRange { tag: u32, capacity: usize },
}

/// Main error type for all shardstore operations.
#[derive(Debug, Error)]
pub enum ShardStoreError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (config file or control line).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tag(#[from] TagError),

    /// Forward target is not in the peer table.
    #[error("no connection to shard {0}")]
    UnknownPeer(ShardId),

    /// Outbound queue of a connection is full.
    #[error("outbound queue full ({0} frames pending)")]
    Backpressure(usize),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid configuration or unexpected reply shape.
    #[error("{0}")]
    Invalid(String),
}

/// Result type alias using ShardStoreError.
pub type Result<T> = std::result::Result<T, ShardStoreError>;
