//! Error types shared by the leader, the followers and the client.

use thiserror::Error;

use crate::leader::FollowerId;

/// Result alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the replication core.
#[derive(Debug, Error)]
pub enum Error {
    /// GET or DELETE for a key the store does not hold.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The strict strategy did not collect enough acknowledgements before the
    /// deadline. The write was not applied on the leader.
    #[error("replication timed out for seq {sequence} ({received}/{required} acks)")]
    ReplicationTimeout {
        sequence: u64,
        received: usize,
        required: usize,
    },

    /// Last-writer-wins rejected a write older than the stored entry.
    #[error("stale write to {key} rejected (incoming ts {incoming} < stored ts {current})")]
    StaleWrite {
        key: String,
        incoming: u64,
        current: u64,
    },

    /// The follower's writer task is gone, so nothing can be delivered to it.
    #[error("follower {follower} is unreachable")]
    PeerUnreachable { follower: FollowerId },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding failed: {0}")]
    Checkpoint(#[from] serde_json::Error),
}

/// Wire-format violations detected while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported wire version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("unknown status code {0}")]
    UnknownStatus(i32),

    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} is out of range")]
    OutOfRange(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("frame length {declared} does not match its content ({actual} bytes)")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}
