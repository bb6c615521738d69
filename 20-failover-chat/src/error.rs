//! Error types shared across the node and the client.

use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{registry::ClientId, role::Role};

/// Failures surfaced by a [`FramedReader`](crate::frame::FramedReader) or
/// [`FramedWriter`](crate::frame::FramedWriter).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The remote end went away, either cleanly or through an I/O error.
    #[error("channel closed")]
    Closed,

    /// The byte stream violated the framing rules. Fatal for the connection.
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),
}

impl ChannelError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

/// Ways a frame can fail to decode.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A length of zero leaves no room for the kind byte.
    #[error("frame length is zero")]
    EmptyFrame,

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// The stream ended before the advertised length arrived.
    #[error("stream ended mid-frame: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
}

/// Errors raised while dialing the backup from the primary.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {addr} unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("handshake with peer {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: ChannelError,
    },
}

/// Rejected role transitions.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RoleError {
    /// The node was already promoted. Callers treat this as a no-op.
    #[error("promotion already occurred")]
    PromotionAlreadyOccurred,

    #[error("only a backup can be promoted (current role: {0})")]
    NotBackup(Role),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client {0} is already registered")]
    AlreadyRegistered(ClientId),
}

/// Errors surfaced to the user-facing side of a client session.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Terminal: the session will not try again.
    #[error("gave up reconnecting to {endpoint} after {attempts} attempts")]
    ReconnectExhausted { endpoint: String, attempts: u32 },

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
