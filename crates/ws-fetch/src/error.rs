use crate::envelope::Response;

use proven_socket::SocketError;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client.
///
/// Errors tied to one request reject only that request. Connection-wide
/// failures are reported through the error and close listeners instead.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The transport rejected the target address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Transport-level error event or send failure.
    #[error("Transport error: {0}")]
    Transport(SocketError),

    /// `close` was called while the socket was not open.
    #[error("Socket is not open")]
    NotOpen,

    /// The last closure was abnormal; the request was not queued.
    #[error("Connection closed abnormally")]
    ConnectionAbnormal,

    /// The connection closed cleanly before a response arrived.
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    /// An inbound frame was not a valid response envelope.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The peer answered with a status outside the success range.
    #[error("Request {} failed with status {}", .0.id, .0.status)]
    Status(Response),

    /// The request could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(String),

    /// The client was shut down or its connection task is gone.
    #[error("Client has shut down")]
    Shutdown,

    /// The client was built with incomplete configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<SocketError> for Error {
    fn from(error: SocketError) -> Self {
        match error {
            SocketError::InvalidAddress(address) => Self::InvalidAddress(address),
            other => Self::Transport(other),
        }
    }
}

impl Error {
    /// The response carried by a [`Error::Status`] rejection.
    #[must_use]
    pub const fn response(&self) -> Option<&Response> {
        match self {
            Self::Status(response) => Some(response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_error_mapping() {
        assert!(matches!(
            Error::from(SocketError::InvalidAddress("x".to_string())),
            Error::InvalidAddress(address) if address == "x"
        ));
        assert!(matches!(
            Error::from(SocketError::ConnectionClosed),
            Error::Transport(SocketError::ConnectionClosed)
        ));
        assert!(Error::NotOpen.response().is_none());
    }
}
