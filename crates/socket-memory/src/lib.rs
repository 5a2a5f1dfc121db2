//! In-memory socket implementation for testing
//!
//! Every socket opened through a [`MemoryConnector`] is handed to the paired
//! [`MemoryServer`] as a [`MemoryPeer`]. The peer decides when the handshake
//! completes, what the client receives, and how the connection ends, which makes
//! connection-lifecycle behaviour reproducible under a paused tokio clock.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use parking_lot::Mutex;
use proven_socket::{
    ABNORMAL_CLOSURE, CloseEvent, Connector, OpenedSocket, ReadyState, Socket, SocketError,
    SocketEvent,
};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Address scheme accepted by [`MemoryConnector`].
pub const MEMORY_SCHEME: &str = "memory://";

/// A frame sent by the client, as observed by the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerFrame {
    /// A text frame.
    Text(String),

    /// The client started a closing handshake.
    Close {
        /// Close code sent by the client.
        code: u16,
        /// Close reason sent by the client.
        reason: String,
    },
}

/// State shared between the client handle and the peer.
struct Shared {
    id: Uuid,
    state: Mutex<ReadyState>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl Shared {
    fn emit(&self, event: SocketEvent) {
        // The client may already have dropped its receiver.
        let _ = self.events.send(event);
    }

    /// Transition to `Closed` exactly once and report it.
    fn finish(&self, event: CloseEvent) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ReadyState::Closed {
                return false;
            }
            *state = ReadyState::Closed;
        }

        debug!(
            "Memory socket {} closed (code {}, clean {})",
            self.id, event.code, event.was_clean
        );
        self.emit(SocketEvent::Close(event));
        true
    }
}

/// Connector that routes sockets to a [`MemoryServer`] in the same process.
#[derive(Clone)]
pub struct MemoryConnector {
    peers_tx: flume::Sender<MemoryPeer>,
    opened: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Create a connector and the server that receives its sockets.
    #[must_use]
    pub fn new() -> (Self, MemoryServer) {
        let (peers_tx, peers_rx) = flume::unbounded();
        let opened = Arc::new(AtomicUsize::new(0));

        (
            Self {
                peers_tx,
                opened: Arc::clone(&opened),
            },
            MemoryServer { peers_rx, opened },
        )
    }
}

impl Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("opened", &self.opened.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connector for MemoryConnector {
    fn open(&self, address: &str) -> Result<OpenedSocket, SocketError> {
        if !address.starts_with(MEMORY_SCHEME) {
            return Err(SocketError::InvalidAddress(format!(
                "Expected a {MEMORY_SCHEME} address, got {address}"
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (to_peer_tx, to_peer_rx) = flume::unbounded();

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: Mutex::new(ReadyState::Connecting),
            events: events_tx,
        });

        self.opened.fetch_add(1, Ordering::SeqCst);

        let peer = MemoryPeer {
            address: address.to_string(),
            shared: Arc::clone(&shared),
            from_client: to_peer_rx,
        };

        if self.peers_tx.send(peer).is_err() {
            // Nobody is listening: behave like a refused connection.
            shared.emit(SocketEvent::Error(SocketError::ConnectionFailed(
                "Memory server dropped".to_string(),
            )));
            shared.finish(CloseEvent::abnormal());
        }

        info!("Memory socket {} opened for {}", shared.id, address);

        Ok(OpenedSocket {
            socket: Box::new(MemorySocket {
                shared,
                to_peer: to_peer_tx,
            }),
            events: events_rx,
        })
    }
}

/// Server side of a [`MemoryConnector`].
pub struct MemoryServer {
    peers_rx: flume::Receiver<MemoryPeer>,
    opened: Arc<AtomicUsize>,
}

impl MemoryServer {
    /// Wait for the next socket opened by the client.
    ///
    /// Returns `None` once every connector clone has been dropped.
    pub async fn next_peer(&self) -> Option<MemoryPeer> {
        self.peers_rx.recv_async().await.ok()
    }

    /// Take an already opened socket without waiting.
    #[must_use]
    pub fn try_next_peer(&self) -> Option<MemoryPeer> {
        self.peers_rx.try_recv().ok()
    }

    /// Number of sockets constructed so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("opened", &self.opened())
            .finish()
    }
}

/// Client-side handle of a memory socket.
struct MemorySocket {
    shared: Arc<Shared>,
    to_peer: flume::Sender<PeerFrame>,
}

impl Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket")
            .field("id", &self.shared.id)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

impl Socket for MemorySocket {
    fn ready_state(&self) -> ReadyState {
        *self.shared.state.lock()
    }

    fn send(&self, text: String) -> Result<(), SocketError> {
        if self.ready_state() != ReadyState::Open {
            return Err(SocketError::ConnectionClosed);
        }

        debug!("Memory socket {} sending {} bytes", self.shared.id, text.len());

        self.to_peer
            .send(PeerFrame::Text(text))
            .map_err(|_| SocketError::ConnectionClosed)
    }

    fn close(&self, code: u16, reason: &str) -> Result<(), SocketError> {
        let previous = {
            let mut state = self.shared.state.lock();
            let previous = *state;
            if previous == ReadyState::Open {
                *state = ReadyState::Closing;
            }
            previous
        };

        match previous {
            ReadyState::Open => {
                let _ = self.to_peer.send(PeerFrame::Close {
                    code,
                    reason: reason.to_string(),
                });
                // The in-memory peer acknowledges the handshake immediately.
                self.shared.finish(CloseEvent::clean(code, reason));
            }
            ReadyState::Connecting => {
                self.shared.finish(CloseEvent::abnormal());
            }
            ReadyState::Closing | ReadyState::Closed => {}
        }

        Ok(())
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        let state = *self.shared.state.lock();
        if state == ReadyState::Open || state == ReadyState::Connecting {
            let _ = self.to_peer.send(PeerFrame::Close {
                code: proven_socket::NORMAL_CLOSURE,
                reason: String::new(),
            });
            *self.shared.state.lock() = ReadyState::Closed;
        }
    }
}

/// Server-side view of one memory socket.
pub struct MemoryPeer {
    address: String,
    shared: Arc<Shared>,
    from_client: flume::Receiver<PeerFrame>,
}

impl MemoryPeer {
    /// Address the client opened.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current readiness of the client's socket.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        *self.shared.state.lock()
    }

    /// Complete the handshake.
    pub fn accept(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state != ReadyState::Connecting {
                return;
            }
            *state = ReadyState::Open;
        }

        debug!("Memory socket {} accepted", self.shared.id);
        self.shared.emit(SocketEvent::Open);
    }

    /// Fail the handshake: an error event followed by an abnormal close.
    pub fn refuse(&self, reason: &str) {
        if self.ready_state() == ReadyState::Closed {
            return;
        }

        self.shared
            .emit(SocketEvent::Error(SocketError::ConnectionFailed(
                reason.to_string(),
            )));
        self.shared.finish(CloseEvent::abnormal());
    }

    /// Deliver a text frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::ConnectionClosed`] unless the socket is open.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SocketError> {
        if self.ready_state() != ReadyState::Open {
            return Err(SocketError::ConnectionClosed);
        }

        self.shared.emit(SocketEvent::Message(text.into()));
        Ok(())
    }

    /// Report a transport error without closing the connection.
    pub fn fail(&self, error: SocketError) {
        self.shared.emit(SocketEvent::Error(error));
    }

    /// Wait for the next frame from the client.
    ///
    /// Returns `None` once the client has dropped its socket.
    pub async fn recv(&self) -> Option<PeerFrame> {
        self.from_client.recv_async().await.ok()
    }

    /// Wait for the next text frame from the client, skipping close frames.
    pub async fn recv_text(&self) -> Option<String> {
        loop {
            match self.recv().await? {
                PeerFrame::Text(text) => return Some(text),
                PeerFrame::Close { .. } => {}
            }
        }
    }

    /// Take a frame from the client without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<PeerFrame> {
        self.from_client.try_recv().ok()
    }

    /// Close the connection from the server side with a completed handshake.
    pub fn close(&self, code: u16, reason: &str) {
        self.shared.finish(CloseEvent::clean(code, reason));
    }

    /// Drop the connection without a closing handshake.
    pub fn drop_connection(&self) {
        self.shared.finish(CloseEvent {
            code: ABNORMAL_CLOSURE,
            reason: String::new(),
            was_clean: false,
        });
    }
}

impl Debug for MemoryPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("id", &self.shared.id)
            .field("address", &self.address)
            .field("state", &self.ready_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(connector: &MemoryConnector) -> OpenedSocket {
        connector.open("memory://test").unwrap()
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let (connector, _server) = MemoryConnector::new();
        let result = connector.open("ws://localhost:1234");
        assert!(matches!(result, Err(SocketError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_accept_and_exchange() {
        let _ = tracing_subscriber::fmt::try_init();

        let (connector, server) = MemoryConnector::new();
        let OpenedSocket { socket, mut events } = open(&connector);
        assert_eq!(socket.ready_state(), ReadyState::Connecting);

        let peer = server.next_peer().await.unwrap();
        assert_eq!(peer.address(), "memory://test");
        peer.accept();

        assert_eq!(events.recv().await, Some(SocketEvent::Open));
        assert_eq!(socket.ready_state(), ReadyState::Open);

        socket.send("hello".to_string()).unwrap();
        assert_eq!(peer.recv_text().await.as_deref(), Some("hello"));

        peer.send("world").unwrap();
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Message("world".to_string()))
        );
        assert_eq!(server.opened(), 1);
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (connector, _server) = MemoryConnector::new();
        let opened = open(&connector);
        assert_eq!(
            opened.socket.send("early".to_string()),
            Err(SocketError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_refuse_reports_error_then_abnormal_close() {
        let (connector, server) = MemoryConnector::new();
        let OpenedSocket { socket, mut events } = open(&connector);

        let peer = server.next_peer().await.unwrap();
        peer.refuse("nope");

        assert!(matches!(
            events.recv().await,
            Some(SocketEvent::Error(SocketError::ConnectionFailed(_)))
        ));
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Close(CloseEvent::abnormal()))
        );
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_client_close_is_clean() {
        let (connector, server) = MemoryConnector::new();
        let OpenedSocket { socket, mut events } = open(&connector);
        let peer = server.next_peer().await.unwrap();
        peer.accept();
        let _ = events.recv().await;

        socket.close(4000, "done").unwrap();

        assert_eq!(
            peer.recv().await,
            Some(PeerFrame::Close {
                code: 4000,
                reason: "done".to_string()
            })
        );
        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Close(CloseEvent::clean(4000, "done")))
        );
    }

    #[tokio::test]
    async fn test_close_event_is_emitted_once() {
        let (connector, server) = MemoryConnector::new();
        let OpenedSocket { socket, mut events } = open(&connector);
        let peer = server.next_peer().await.unwrap();
        peer.accept();
        let _ = events.recv().await;

        peer.close(1000, "");
        peer.drop_connection();
        drop(socket);

        assert_eq!(
            events.recv().await,
            Some(SocketEvent::Close(CloseEvent::clean(1000, "")))
        );
        assert!(events.try_recv().is_err());
    }
}
