//! Error taxonomy for the core. See spec §7.
//!
//! Every fallible operation in this crate returns a [`CoreError`] rather than
//! a raw [`std::io::Error`] or a boxed `dyn Error`, so that callers at the
//! connection-engine and dispatcher layers can decide whether an error is
//! fatal (drop the connection) or recoverable (log and continue) by
//! matching on the variant instead of re-deriving that policy from an
//! `io::ErrorKind`.

use std::io;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors produced anywhere in the protocol engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A socket read or write failed. `fatal` classifies the underlying
    /// [`io::ErrorKind`]: `WouldBlock`, `Interrupted`, and the handful of
    /// "try again" kinds are non-fatal and are retried with backoff by the
    /// caller; everything else is fatal.
    #[error("transport error on connection {connection_id}: {source}")]
    Transport {
        connection_id: ConnectionId,
        #[source]
        source: io::Error,
        fatal: bool,
    },

    /// A frame failed validation: bad size, bad signature, or a malformed
    /// handshake message. Always fatal.
    #[error("protocol error on connection {connection_id}: {message}")]
    Protocol {
        connection_id: ConnectionId,
        message: String,
    },

    /// Rate limiting, flood, or diversity fuzzing was detected. Always
    /// fatal and always logged as a security event.
    #[error("security violation on connection {connection_id}: {reason}")]
    Security {
        connection_id: ConnectionId,
        reason: String,
    },

    /// A handler or middleware raised an error. Non-fatal unless it also
    /// carries a transport/protocol cause.
    #[error("handler error on connection {connection_id} for packet type {packet_type}: {source}")]
    Handler {
        connection_id: ConnectionId,
        packet_type: u16,
        #[source]
        source: anyhow::Error,
    },

    /// Handshake or idle timeout elapsed. Always fatal, always a graceful
    /// disconnect.
    #[error("timeout on connection {connection_id}: {kind}")]
    Timeout {
        connection_id: ConnectionId,
        kind: TimeoutKind,
    },

    /// The outbound queue is full, or a caller tried to send an oversized
    /// frame. The connection is preserved in both cases.
    #[error("capacity error on connection {connection_id}: {reason}")]
    Capacity {
        connection_id: ConnectionId,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Handshake,
    Idle,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Handshake => write!(f, "handshake"),
            TimeoutKind::Idle => write!(f, "idle"),
        }
    }
}

impl CoreError {
    /// Whether this error should terminate the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            CoreError::Transport { fatal, .. } => *fatal,
            CoreError::Protocol { .. }
            | CoreError::Security { .. }
            | CoreError::Timeout { .. } => true,
            CoreError::Handler { .. } | CoreError::Capacity { .. } => false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        match self {
            CoreError::Transport { connection_id, .. }
            | CoreError::Protocol { connection_id, .. }
            | CoreError::Security { connection_id, .. }
            | CoreError::Handler { connection_id, .. }
            | CoreError::Timeout { connection_id, .. }
            | CoreError::Capacity { connection_id, .. } => *connection_id,
        }
    }
}

/// Classifies a raw I/O error into the transport fatal/non-fatal split from
/// spec §7: `WouldBlock` / `Interrupted` and the "no buffer space" / "IO
/// pending" family are retried by the caller, everything else tears the
/// connection down.
pub fn classify_io_error(connection_id: ConnectionId, source: io::Error) -> CoreError {
    let fatal = !matches!(
        source.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    );

    CoreError::Transport {
        connection_id,
        source,
        fatal,
    }
}

/// Errors specific to reading/writing a [`crate::packet::Packet`]'s fields.
/// Kept separate from [`CoreError`] because these are pure, synchronous,
/// and never carry a connection id — they are turned into
/// `CoreError::Protocol` once attributed to a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("read of {requested} bytes at offset {offset} exceeds packet length {length}")]
    InvalidPacket {
        offset: usize,
        requested: usize,
        length: usize,
    },
    #[error("write of {requested} bytes at offset {offset} exceeds fixed capacity {capacity}")]
    BufferOverflow {
        offset: usize,
        requested: usize,
        capacity: usize,
    },
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("protobuf decode failed: {0}")]
    ProtoDecode(String),
    #[error("protobuf encode failed: {0}")]
    ProtoEncode(String),
}
