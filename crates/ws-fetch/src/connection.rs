//! The connection manager actor.
//!
//! One tokio task owns the socket, the registry, the listeners and every timer.
//! Client handles talk to it through [`Command`]s, so all state transitions
//! happen in a single place and no locks are needed.

use crate::config::ClientConfig;
use crate::envelope::{FetchOptions, Inbound, PING, PONG, Request};
use crate::error::{Error, Result};
use crate::heartbeat::{Heartbeat, Timer, expired};
use crate::id::IdGenerator;
use crate::reconnect::ReconnectPolicy;
use crate::registry::{
    BroadcastListener, Delivery, Dispatcher, ResponseSender, UnhandledResponseListener,
};

use std::fmt::{self, Debug, Display};
use std::future;
use std::mem;
use std::sync::Arc;

use proven_socket::{
    CloseEvent, Connector, NORMAL_CLOSURE, OpenedSocket, ReadyState, Socket, SocketError,
    SocketEvent, SocketEvents,
};
use tokio::sync::{mpsc, oneshot, watch};

/// Callback invoked for every close event.
pub type ClosedListener = Arc<dyn Fn(&CloseEvent) + Send + Sync>;

/// Callback invoked for every transport error event.
pub type ErrorListener = Arc<dyn Fn(&SocketError) + Send + Sync>;

/// Authoritative state of the client's connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No socket. The initial state.
    #[default]
    Disconnected,

    /// A socket was constructed and the handshake is in progress.
    Connecting,

    /// The socket is open.
    Connected,

    /// A caller-initiated close is in progress.
    Closing,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Close {
        code: u16,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Fetch {
        path: String,
        options: FetchOptions,
        reply: ResponseSender,
    },
    SetBroadcastListener {
        topic: String,
        listener: Option<BroadcastListener>,
    },
    SetUnhandledResponseListener(Option<UnhandledResponseListener>),
    SetClosedListener(Option<ClosedListener>),
    SetErrorListener(Option<ErrorListener>),
    PendingRequests(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// What woke the actor up.
enum Wake {
    Command(Option<Command>),
    Socket(Option<SocketEvent>),
    Heartbeat,
    Idle,
    Retry,
}

async fn next_event(events: &mut Option<SocketEvents>) -> Option<SocketEvent> {
    match events {
        Some(events) => events.recv().await,
        None => future::pending().await,
    }
}

pub(crate) struct ConnectionManager {
    address: String,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    status: watch::Sender<ConnectionStatus>,

    socket: Option<Box<dyn Socket>>,
    events: Option<SocketEvents>,

    /// Whether the last closure was clean or caller-initiated.
    nicely_closed: bool,
    closing_manually: bool,
    connect_after_close: bool,

    reconnect: ReconnectPolicy,
    heartbeat: Heartbeat,
    idle: Timer,
    retry: Timer,

    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    close_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Requests waiting for the socket to open.
    queued: Vec<(Request, ResponseSender)>,

    dispatcher: Dispatcher,
    ids: IdGenerator,
    on_closed: Option<ClosedListener>,
    on_error: Option<ErrorListener>,
}

impl ConnectionManager {
    pub fn new(
        address: String,
        connector: Arc<dyn Connector>,
        config: ClientConfig,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            address,
            connector,
            reconnect: ReconnectPolicy::new(
                config.retry_waiting_time_start,
                config.retry_waiting_time_step,
            ),
            heartbeat: Heartbeat::new(config.heartbeat_interval),
            config,
            status,
            socket: None,
            events: None,
            nicely_closed: true,
            closing_manually: false,
            connect_after_close: false,
            idle: Timer::default(),
            retry: Timer::default(),
            connect_waiters: Vec::new(),
            close_waiters: Vec::new(),
            queued: Vec::new(),
            dispatcher: Dispatcher::default(),
            ids: IdGenerator::default(),
            on_closed: None,
            on_error: None,
        }
    }

    /// Process commands, socket events and timers until shut down.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        diag!(self.config, debug, "Connection manager for {} started", self.address);

        loop {
            let wake = tokio::select! {
                biased;

                event = next_event(&mut self.events) => Wake::Socket(event),
                command = commands.recv() => Wake::Command(command),
                () = expired(self.heartbeat.deadline()) => Wake::Heartbeat,
                () = expired(self.idle.deadline()) => Wake::Idle,
                () = expired(self.retry.deadline()) => Wake::Retry,
            };

            match wake {
                Wake::Socket(Some(event)) => self.on_event(event),
                // The transport went away without reporting a close.
                Wake::Socket(None) => self.on_close(CloseEvent::abnormal()),
                Wake::Command(Some(command)) => {
                    if !self.handle(command) {
                        break;
                    }
                }
                Wake::Command(None) => {
                    self.shutdown();
                    break;
                }
                Wake::Heartbeat => self.on_heartbeat(),
                Wake::Idle => self.on_idle(),
                Wake::Retry => self.on_retry(),
            }
        }

        diag!(self.config, debug, "Connection manager for {} stopped", self.address);
    }

    /// Apply one command. Returns `false` once the actor should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Connect(reply) => self.connect(reply),
            Command::Close {
                code,
                reason,
                reply,
            } => match self.begin_close(code, &reason) {
                Ok(()) => self.close_waiters.push(reply),
                Err(error) => {
                    let _ = reply.send(Err(error));
                }
            },
            Command::Fetch {
                path,
                options,
                reply,
            } => self.fetch(path, options, reply),
            Command::SetBroadcastListener { topic, listener } => {
                self.dispatcher.broadcasts.set(topic, listener);
            }
            Command::SetUnhandledResponseListener(listener) => self.dispatcher.unhandled = listener,
            Command::SetClosedListener(listener) => self.on_closed = listener,
            Command::SetErrorListener(listener) => self.on_error = listener,
            Command::PendingRequests(reply) => {
                let _ = reply.send(self.dispatcher.pending.len());
            }
            Command::Shutdown(reply) => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            diag!(self.config, debug, "Connection status {} -> {}", previous, status);
        }
    }

    fn socket_open(&self) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|socket| socket.ready_state() == ReadyState::Open)
    }

    /// Construct a new socket, superseding any previous one.
    fn open_socket(&mut self) -> Result<()> {
        let OpenedSocket { socket, events } =
            self.connector.open(&self.address).map_err(|error| {
                diag!(self.config, warn, "Failed to open socket to {}: {}", self.address, error);
                Error::from(error)
            })?;

        diag!(self.config, debug, "Opening socket to {}", self.address);

        self.socket = Some(socket);
        self.events = Some(events);
        self.closing_manually = false;
        self.connect_after_close = false;
        self.set_status(ConnectionStatus::Connecting);
        Ok(())
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.status() {
            ConnectionStatus::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionStatus::Connecting => self.connect_waiters.push(reply),
            ConnectionStatus::Closing => {
                self.connect_waiters.push(reply);
                self.connect_after_close = true;
            }
            ConnectionStatus::Disconnected => {
                self.retry.disarm();
                match self.open_socket() {
                    Ok(()) => self.connect_waiters.push(reply),
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
        }
    }

    /// Start a caller-initiated close. Completion is reported by the close event.
    fn begin_close(&mut self, code: u16, reason: &str) -> Result<()> {
        let Some(socket) = self
            .socket
            .as_ref()
            .filter(|socket| socket.ready_state() == ReadyState::Open)
        else {
            return Err(Error::NotOpen);
        };

        socket.close(code, reason)?;

        diag!(self.config, debug, "Closing socket (code {})", code);
        self.closing_manually = true;
        self.set_status(ConnectionStatus::Closing);
        Ok(())
    }

    fn new_request(&mut self, path: String, options: FetchOptions) -> Request {
        let mut id = self.ids.next(&options.method, &path);
        while self.dispatcher.pending.contains(&id)
            || self.queued.iter().any(|(queued, _)| queued.id == id)
        {
            id = self.ids.next(&options.method, &path);
        }
        Request::new(id, path, options)
    }

    fn arm_idle(&mut self) {
        if !self.config.auto_disconnect_after.is_zero() {
            self.idle.arm(self.config.auto_disconnect_after);
        }
    }

    fn fetch(&mut self, path: String, options: FetchOptions, reply: ResponseSender) {
        self.arm_idle();
        let request = self.new_request(path, options);

        match self.status() {
            ConnectionStatus::Connected if self.socket_open() => self.transmit(request, reply),
            ConnectionStatus::Connected
            | ConnectionStatus::Connecting
            | ConnectionStatus::Closing => {
                diag!(self.config, debug, "Queueing request {} until the socket opens", request.id);
                self.queued.push((request, reply));
            }
            ConnectionStatus::Disconnected => {
                if !self.nicely_closed {
                    let _ = reply.send(Err(Error::ConnectionAbnormal));
                    return;
                }

                self.queued.push((request, reply));
                if let Err(error) = self.open_socket() {
                    self.reject_queued(&error);
                }
            }
        }
    }

    /// Register the waiter and write the request frame.
    fn transmit(&mut self, request: Request, reply: ResponseSender) {
        let frame = match request.encode() {
            Ok(frame) => frame,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };

        let id = request.id;
        if let Err(reply) = self.dispatcher.pending.insert(id.clone(), reply) {
            let _ = reply.send(Err(Error::Encode(format!(
                "Correlation id {id} is already pending"
            ))));
            return;
        }

        let sent = self
            .socket
            .as_ref()
            .map_or(Err(SocketError::ConnectionClosed), |socket| socket.send(frame));

        match sent {
            Ok(()) => diag!(self.config, debug, "Sent request {}", id),
            Err(error) => {
                diag!(self.config, warn, "Failed to send request {}: {}", id, error);
                if let Some(reply) = self.dispatcher.pending.take(&id) {
                    let _ = reply.send(Err(error.into()));
                }
            }
        }
    }

    fn send_control(&self, token: &str) {
        if let Some(socket) = &self.socket {
            if let Err(error) = socket.send(token.to_string()) {
                diag!(self.config, warn, "Failed to send {}: {}", token, error);
            } else {
                diag!(self.config, trace, "Sent {}", token);
            }
        }
    }

    fn reject_queued(&mut self, error: &Error) {
        for (request, reply) in self.queued.drain(..) {
            diag!(self.config, debug, "Rejecting queued request {}: {}", request.id, error);
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn reject_connect_waiters(&mut self, error: &Error) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn on_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Open => self.on_open(),
            SocketEvent::Message(text) => self.on_message(&text),
            SocketEvent::Error(error) => self.on_socket_error(error),
            SocketEvent::Close(event) => self.on_close(event),
        }
    }

    fn on_open(&mut self) {
        diag!(self.config, info, "Connected to {}", self.address);

        self.set_status(ConnectionStatus::Connected);
        self.reconnect.reset();
        self.retry.disarm();
        self.heartbeat.start();
        self.arm_idle();

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        for (request, reply) in mem::take(&mut self.queued) {
            self.transmit(request, reply);
        }
    }

    fn on_message(&mut self, text: &str) {
        match Inbound::parse(text) {
            Ok(Inbound::Ping) => {
                diag!(self.config, trace, "Received {}", PING);
                self.send_control(PONG);
            }
            Ok(Inbound::Pong) => diag!(self.config, trace, "Received {}", PONG),
            Ok(Inbound::Control(token)) => {
                diag!(self.config, debug, "Ignoring control token {}", token);
            }
            Ok(Inbound::Response(response)) => {
                let id = response.id.clone();
                match self.dispatcher.dispatch(response) {
                    Delivery::Dropped => {
                        diag!(self.config, warn, "Dropping response {} with no receiver", id);
                    }
                    delivery => diag!(self.config, debug, "Response {} delivered to {:?}", id, delivery),
                }
            }
            Err(error) => diag!(self.config, warn, "Discarding frame: {}", error),
        }
    }

    fn on_socket_error(&mut self, error: SocketError) {
        match &self.on_error {
            Some(listener) => listener(&error),
            None => diag!(self.config, warn, "Socket error: {}", error),
        }

        let error = Error::from(error);
        self.reject_connect_waiters(&error);
        self.reject_queued(&error);
    }

    fn on_close(&mut self, event: CloseEvent) {
        let clean = event.was_clean || self.closing_manually;
        self.nicely_closed = clean;
        self.socket = None;
        self.events = None;
        self.heartbeat.stop();
        self.idle.disarm();
        self.set_status(ConnectionStatus::Disconnected);

        diag!(
            self.config,
            info,
            "Disconnected from {} (code {}, clean {})",
            self.address,
            event.code,
            clean
        );

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        let error = if clean {
            Error::ConnectionClosed
        } else {
            Error::ConnectionAbnormal
        };

        if self.config.fail_pending_on_close {
            let rejected = self.dispatcher.pending.reject_all(&error);
            if rejected > 0 {
                diag!(self.config, debug, "Rejected {} pending requests", rejected);
            }
        }

        if let Some(listener) = &self.on_closed {
            listener(&event);
        }

        if !clean {
            self.reject_queued(&Error::ConnectionAbnormal);
        }

        if self.connect_after_close || !self.queued.is_empty() {
            if let Err(error) = self.open_socket() {
                self.reject_queued(&error);
                self.reject_connect_waiters(&error);
            }
            return;
        }

        self.reject_connect_waiters(&error);

        if !clean && self.reconnect.is_enabled() {
            let delay = self.reconnect.next_delay();
            diag!(self.config, info, "Reconnecting to {} in {:?}", self.address, delay);
            self.retry.arm(delay);
        }
    }

    fn on_heartbeat(&mut self) {
        let open = self.socket_open();
        if self.heartbeat.on_due(open) {
            self.send_control(PING);
        }
    }

    fn on_idle(&mut self) {
        self.idle.disarm();
        if self.socket_open() {
            diag!(self.config, info, "Closing idle connection to {}", self.address);
            let _ = self.begin_close(NORMAL_CLOSURE, "");
        }
    }

    fn on_retry(&mut self) {
        self.retry.disarm();
        if self.status() != ConnectionStatus::Disconnected {
            return;
        }

        diag!(self.config, debug, "Reconnection attempt to {}", self.address);
        if self.open_socket().is_err() {
            let delay = self.reconnect.next_delay();
            diag!(self.config, info, "Reconnecting to {} in {:?}", self.address, delay);
            self.retry.arm(delay);
        }
    }

    fn shutdown(&mut self) {
        self.heartbeat.stop();
        self.idle.disarm();
        self.retry.disarm();
        self.events = None;

        if let Some(socket) = self.socket.take() {
            if socket.ready_state() == ReadyState::Open {
                let _ = socket.close(NORMAL_CLOSURE, "");
            }
        }

        let rejected = self.dispatcher.pending.reject_all(&Error::Shutdown);
        self.reject_queued(&Error::Shutdown);
        self.reject_connect_waiters(&Error::Shutdown);
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        self.set_status(ConnectionStatus::Disconnected);
        diag!(self.config, info, "Client for {} shut down ({} pending rejected)", self.address, rejected);
    }
}

impl Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.address)
            .field("status", &self.status())
            .field("socket", &self.socket)
            .field("nicely_closed", &self.nicely_closed)
            .field("queued", &self.queued.len())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Response;

    use proven_socket_memory::{MemoryConnector, MemoryPeer, MemoryServer, PeerFrame};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::{Instant, sleep};

    struct Harness {
        commands: mpsc::UnboundedSender<Command>,
        status: watch::Receiver<ConnectionStatus>,
        server: MemoryServer,
    }

    fn spawn(config: ClientConfig) -> Harness {
        let (connector, server) = MemoryConnector::new();
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            "memory://test".to_string(),
            Arc::new(connector),
            config,
            status_tx,
        );
        tokio::spawn(manager.run(commands_rx));
        Harness {
            commands,
            status,
            server,
        }
    }

    fn quiet() -> ClientConfig {
        ClientConfig {
            heartbeat_interval: Duration::ZERO,
            ..ClientConfig::default()
        }
    }

    impl Harness {
        fn fetch(&self, path: &str) -> oneshot::Receiver<Result<Response>> {
            let (reply, rx) = oneshot::channel();
            self.commands
                .send(Command::Fetch {
                    path: path.to_string(),
                    options: FetchOptions::default(),
                    reply,
                })
                .unwrap();
            rx
        }

        async fn accept(&self) -> MemoryPeer {
            let peer = self.server.next_peer().await.unwrap();
            peer.accept();
            peer
        }
    }

    async fn request_id(peer: &MemoryPeer) -> String {
        let frame: Value = serde_json::from_str(&peer.recv_text().await.unwrap()).unwrap();
        frame["id"].as_str().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_queues_until_open() {
        let harness = spawn(quiet());
        let rx = harness.fetch("/users");

        let peer = harness.server.next_peer().await.unwrap();
        assert_eq!(*harness.status.borrow(), ConnectionStatus::Connecting);
        assert!(peer.try_recv().is_none());

        peer.accept();
        let id = request_id(&peer).await;
        assert!(id.starts_with("get/users$"));

        peer.send(json!({"id": id, "status": 200, "body": "ok"}).to_string())
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap().body, json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_frame_reaches_peer() {
        let harness = spawn(quiet());
        let (reply, rx) = oneshot::channel();
        harness.commands.send(Command::Connect(reply)).unwrap();
        let peer = harness.accept().await;
        rx.await.unwrap().unwrap();

        let (reply, rx) = oneshot::channel();
        harness
            .commands
            .send(Command::Close {
                code: 4000,
                reason: "bye".to_string(),
                reply,
            })
            .unwrap();
        rx.await.unwrap().unwrap();

        assert_eq!(
            peer.recv().await,
            Some(PeerFrame::Close {
                code: 4000,
                reason: "bye".to_string()
            })
        );
        assert_eq!(*harness.status.borrow(), ConnectionStatus::Disconnected);
    }

    /// Refuses to construct sockets while `refusing` is set.
    #[derive(Debug)]
    struct FlakyConnector {
        inner: MemoryConnector,
        refusing: Arc<AtomicBool>,
    }

    impl Connector for FlakyConnector {
        fn open(&self, address: &str) -> std::result::Result<OpenedSocket, SocketError> {
            if self.refusing.load(Ordering::SeqCst) {
                return Err(SocketError::InvalidAddress("refused".to_string()));
            }
            self.inner.open(address)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_continues_after_refused_open() {
        let (inner, server) = MemoryConnector::new();
        let refusing = Arc::new(AtomicBool::new(false));
        let connector = FlakyConnector {
            inner,
            refusing: Arc::clone(&refusing),
        };
        let (status_tx, _status) = watch::channel(ConnectionStatus::Disconnected);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            "memory://test".to_string(),
            Arc::new(connector),
            ClientConfig {
                retry_waiting_time_start: Duration::from_millis(100),
                retry_waiting_time_step: Duration::from_millis(100),
                ..quiet()
            },
            status_tx,
        );
        tokio::spawn(manager.run(commands_rx));

        let (reply, rx) = oneshot::channel();
        commands.send(Command::Connect(reply)).unwrap();
        let peer = server.next_peer().await.unwrap();
        peer.accept();
        rx.await.unwrap().unwrap();

        refusing.store(true, Ordering::SeqCst);
        let lost = Instant::now();
        peer.drop_connection();

        // The attempt at 100ms is refused; the next one follows 200ms later.
        sleep(Duration::from_millis(150)).await;
        refusing.store(false, Ordering::SeqCst);

        let _peer = server.next_peer().await.unwrap();
        assert_eq!(lost.elapsed(), Duration::from_millis(300));
        assert_eq!(server.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_commands_shuts_down() {
        let harness = spawn(quiet());
        let rx = harness.fetch("/slow");
        let peer = harness.accept().await;
        let _ = request_id(&peer).await;

        drop(harness.commands);
        assert!(matches!(rx.await.unwrap(), Err(Error::Shutdown)));
    }
}
