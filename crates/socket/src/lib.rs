//! Message-oriented socket abstraction.
//!
//! A [`Connector`] turns an address into a [`Socket`] handle plus a stream of
//! [`SocketEvent`]s. Opening never blocks: the handle starts out
//! [`ReadyState::Connecting`] and the outcome of the handshake is reported later
//! as either [`SocketEvent::Open`] or [`SocketEvent::Error`] followed by
//! [`SocketEvent::Close`].
//!
//! Concrete transports (WebSocket, in-memory) live in separate crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::SocketError;

use std::fmt::{self, Debug, Display};

use tokio::sync::mpsc;

/// Close code used when the connection was lost without a closing handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code for a normal, caller-initiated closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the peer's close frame carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Readiness of a socket handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// The handshake is in progress.
    Connecting,

    /// The connection is established and can carry frames.
    Open,

    /// A closing handshake is in progress.
    Closing,

    /// The connection is closed or could not be opened.
    Closed,
}

impl Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Details of a closed connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code sent by the peer, or [`ABNORMAL_CLOSURE`].
    pub code: u16,

    /// Close reason sent by the peer.
    pub reason: String,

    /// Whether the closing handshake completed.
    pub was_clean: bool,
}

impl CloseEvent {
    /// A close event for a handshake that completed.
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// A close event for a connection lost without a handshake.
    #[must_use]
    pub const fn abnormal() -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
            was_clean: false,
        }
    }
}

/// Events emitted by a socket over its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// The handshake completed; the socket is open.
    Open,

    /// A text frame arrived.
    Message(String),

    /// A transport-level error. Closure is reported separately.
    Error(SocketError),

    /// The connection closed. Always the last event.
    Close(CloseEvent),
}

/// Receiving side of a socket's event stream.
pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;

/// A handle to one transport connection.
pub trait Socket: Debug + Send + Sync {
    /// Current readiness, read from the transport itself.
    fn ready_state(&self) -> ReadyState;

    /// Queue a text frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::ConnectionClosed`] unless the socket is open.
    fn send(&self, text: String) -> Result<(), SocketError>;

    /// Start the closing handshake. Completion is reported as a
    /// [`SocketEvent::Close`].
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot start the handshake.
    fn close(&self, code: u16, reason: &str) -> Result<(), SocketError>;
}

/// A freshly constructed socket and its event stream.
#[derive(Debug)]
pub struct OpenedSocket {
    /// Handle used to send frames and close the connection.
    pub socket: Box<dyn Socket>,

    /// Events for this socket only.
    pub events: SocketEvents,
}

/// Factory for socket handles.
pub trait Connector: Debug + Send + Sync + 'static {
    /// Construct a socket for `address` and begin connecting.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::InvalidAddress`] if the address is rejected.
    fn open(&self, address: &str) -> Result<OpenedSocket, SocketError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abnormal_close_event() {
        let event = CloseEvent::abnormal();
        assert_eq!(event.code, ABNORMAL_CLOSURE);
        assert!(!event.was_clean);
        assert!(event.reason.is_empty());
    }

    #[test]
    fn test_clean_close_event() {
        let event = CloseEvent::clean(NORMAL_CLOSURE, "bye");
        assert_eq!(event.code, NORMAL_CLOSURE);
        assert_eq!(event.reason, "bye");
        assert!(event.was_clean);
    }

    #[test]
    fn test_ready_state_display() {
        assert_eq!(ReadyState::Connecting.to_string(), "connecting");
        assert_eq!(ReadyState::Closed.to_string(), "closed");
    }
}
