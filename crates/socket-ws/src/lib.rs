//! WebSocket implementation of the socket abstraction
//!
//! Each opened socket is driven by its own tokio task which owns the
//! `tokio-tungstenite` stream. The [`Socket`] handle only talks to that task
//! through a channel, so sending and closing never block the caller.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use proven_socket::{
    CloseEvent, Connector, NO_STATUS_RECEIVED, NORMAL_CLOSURE, OpenedSocket, ReadyState, Socket,
    SocketError, SocketEvent,
};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connector for `ws://` addresses.
///
/// `wss://` is refused up front because no TLS backend is compiled in.
#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new WebSocket connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, address: &str) -> Result<OpenedSocket, SocketError> {
        let url = Url::parse(address)
            .map_err(|e| SocketError::InvalidAddress(format!("Invalid URL: {e}")))?;

        match url.scheme() {
            "ws" => {}
            "wss" => {
                return Err(SocketError::InvalidAddress(
                    "wss:// requires TLS support, which is not enabled".to_string(),
                ));
            }
            scheme => {
                return Err(SocketError::InvalidAddress(format!(
                    "Unsupported scheme: {scheme}"
                )));
            }
        }

        let state = Arc::new(Mutex::new(ReadyState::Connecting));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        debug!("Connecting to WebSocket at {}", url);

        tokio::spawn(drive(url, Arc::clone(&state), events_tx, outbound_rx));

        Ok(OpenedSocket {
            socket: Box::new(WebSocketHandle {
                state,
                outbound: outbound_tx,
            }),
            events: events_rx,
        })
    }
}

/// Requests from the handle to the connection task.
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Handle to a WebSocket driven by a background task.
struct WebSocketHandle {
    state: Arc<Mutex<ReadyState>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Debug for WebSocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketHandle")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Socket for WebSocketHandle {
    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    fn send(&self, text: String) -> Result<(), SocketError> {
        if self.ready_state() != ReadyState::Open {
            return Err(SocketError::ConnectionClosed);
        }

        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| SocketError::ConnectionClosed)
    }

    fn close(&self, code: u16, reason: &str) -> Result<(), SocketError> {
        let mut state = self.state.lock();
        match *state {
            ReadyState::Connecting | ReadyState::Open => {
                *state = ReadyState::Closing;
                self.outbound
                    .send(Outbound::Close {
                        code,
                        reason: reason.to_string(),
                    })
                    .map_err(|_| SocketError::ConnectionClosed)
            }
            ReadyState::Closing | ReadyState::Closed => Ok(()),
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<SocketEvent>, event: SocketEvent) {
    // The owner may have dropped the receiver after replacing this socket.
    let _ = events.send(event);
}

/// Report a stream failure and produce the abnormal close that follows it.
fn failure(events: &mpsc::UnboundedSender<SocketEvent>, error: &WsError) -> CloseEvent {
    warn!("WebSocket error: {}", error);
    emit(events, SocketEvent::Error(SocketError::Io(error.to_string())));
    CloseEvent::abnormal()
}

async fn drive(
    url: Url,
    state: Arc<Mutex<ReadyState>>,
    events: mpsc::UnboundedSender<SocketEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!("WebSocket connect to {} failed: {}", url, e);
            *state.lock() = ReadyState::Closed;
            emit(
                &events,
                SocketEvent::Error(SocketError::ConnectionFailed(format!(
                    "WebSocket connect failed: {e}"
                ))),
            );
            emit(&events, SocketEvent::Close(CloseEvent::abnormal()));
            return;
        }
    };

    let opened = {
        let mut state = state.lock();
        if *state == ReadyState::Connecting {
            *state = ReadyState::Open;
            true
        } else {
            false
        }
    };

    if opened {
        info!("WebSocket connected to {}", url);
        emit(&events, SocketEvent::Open);
    }

    let (mut sink, mut stream) = ws_stream.split();
    let mut close_sent = false;
    let mut peer_close: Option<CloseEvent> = None;

    let close = loop {
        tokio::select! {
            command = outbound.recv(), if !close_sent => {
                let message = match command {
                    Some(Outbound::Text(text)) => Message::text(text),
                    Some(Outbound::Close { code, reason }) => {
                        close_sent = true;
                        Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        }))
                    }
                    None => {
                        // Handle dropped.
                        close_sent = true;
                        Message::Close(Some(CloseFrame {
                            code: CloseCode::from(NORMAL_CLOSURE),
                            reason: String::new().into(),
                        }))
                    }
                };

                if close_sent {
                    *state.lock() = ReadyState::Closing;
                }

                if let Err(e) = sink.send(message).await {
                    break failure(&events, &e);
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    emit(&events, SocketEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket close frame received: {:?}", frame);
                    *state.lock() = ReadyState::Closing;
                    peer_close = Some(frame.map_or_else(
                        || CloseEvent::clean(NO_STATUS_RECEIVED, ""),
                        |frame| CloseEvent::clean(u16::from(frame.code), frame.reason.as_str()),
                    ));
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(_)) => {
                    // Ping/pong frames are answered by tungstenite.
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    break peer_close.take().unwrap_or_else(CloseEvent::abnormal);
                }
                Some(Err(e)) => break failure(&events, &e),
            }
        }
    };

    debug!(
        "WebSocket to {} closed (code {}, clean {})",
        url, close.code, close.was_clean
    );

    *state.lock() = ReadyState::Closed;
    emit(&events, SocketEvent::Close(close));
}
