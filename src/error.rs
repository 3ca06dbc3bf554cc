//! Error types for conveyor.

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for all conveyor operations.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (oversized frame, truncated message, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream on a message boundary.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The host specification could not be resolved to a TCP endpoint.
    #[error("Cannot resolve {host}: {source}")]
    Resolve {
        /// Host specification as given.
        host: String,
        /// Underlying resolver error.
        #[source]
        source: std::io::Error,
    },

    /// The listener could not be bound.
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        /// Resolved address.
        addr: SocketAddr,
        /// Underlying bind error.
        #[source]
        source: std::io::Error,
    },

    /// The dispatcher already owns a listener.
    #[error("Server already listening")]
    AlreadyListening,

    /// The dispatcher (or server) owns no listener.
    #[error("Server not listening")]
    NotListening,

    /// `start` was called on an attendant that is running or stopped.
    #[error("Attendant cannot start: it is either running or stopped")]
    AttendantNotNew,

    /// `send` was called on a stopped attendant.
    #[error("Attendant cannot send: it is stopped")]
    AttendantStopped,

    /// `stop` was called on a stopped attendant.
    #[error("Attendant cannot stop: it is already stopped")]
    AttendantAlreadyStopped,

    /// Invalid or missing constructor argument.
    #[error("Argument error: {0}")]
    Argument(String),
}

impl ConveyorError {
    /// Whether this error means the peer closed the stream cleanly.
    ///
    /// Marshalers flag a clean close by returning [`ConveyorError::ConnectionClosed`];
    /// a bare end-of-stream from the socket counts as well.
    pub fn is_graceful(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Result type alias using ConveyorError.
pub type Result<T> = std::result::Result<T, ConveyorError>;
