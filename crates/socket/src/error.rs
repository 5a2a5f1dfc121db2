use thiserror::Error;

/// Errors reported by a socket transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SocketError {
    /// The target address was rejected before any connection attempt.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The connection could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The socket is not open.
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(String),

    /// The peer violated the framing protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
