use crate::config::ClientConfig;
use crate::connection::{
    ClosedListener, Command, ConnectionManager, ConnectionStatus, ErrorListener,
};
use crate::envelope::{FetchOptions, Response};
use crate::error::{Error, Result};
use crate::registry::{BroadcastListener, UnhandledResponseListener};

use std::sync::Arc;
use std::time::Duration;

use proven_socket::Connector;
use tokio::sync::{mpsc, oneshot, watch};

/// Handle to a request/response channel over one socket.
///
/// Cloning is cheap; every clone talks to the same connection. The
/// connection task stops when [`Client::shutdown`] is called or the last
/// clone is dropped.
#[derive(Clone, Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl Client {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Send a command and wait for its reply.
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    fn notify(&self, command: Command) {
        // A stopped connection task has nothing left to configure.
        let _ = self.commands.send(command);
    }

    /// Open the connection, waiting until the socket is open.
    ///
    /// Returns immediately if already connected.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the transport rejects the
    /// address, or with the transport error or closure that ended the attempt.
    pub async fn connect(&self) -> Result<()> {
        self.call(Command::Connect).await?
    }

    /// Close the connection, waiting until the close is observed.
    ///
    /// A caller-initiated close never triggers automatic reconnection.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotOpen`] unless the socket is open.
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.call(|reply| Command::Close {
            code,
            reason,
            reply,
        })
        .await?
    }

    /// Close the connection if it is open, then connect again.
    ///
    /// # Errors
    ///
    /// Fails like [`Client::connect`].
    pub async fn reconnect(&self, code: u16) -> Result<()> {
        // Not being open is the expected case when already disconnected.
        let _ = self.close(code, "").await;
        self.connect().await
    }

    /// Send a request and wait for the matching response.
    ///
    /// The connection is opened on demand when the last closure was clean.
    /// Statuses in `[200, 300)` and `304` resolve to `Ok`; anything else is
    /// returned as [`Error::Status`] carrying the response.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ConnectionAbnormal`] if the last closure was
    /// abnormal, with [`Error::Status`] for error statuses, and with
    /// [`Error::ConnectionClosed`] / [`Error::ConnectionAbnormal`] if the
    /// connection closes while the request is in flight.
    pub async fn fetch(&self, path: impl Into<String>, options: FetchOptions) -> Result<Response> {
        let path = path.into();
        self.call(|reply| Command::Fetch {
            path,
            options,
            reply,
        })
        .await?
    }

    /// Register the standing listener for broadcasts on `topic`, replacing
    /// any previous one. `None` removes it.
    pub fn set_broadcast_listener(
        &self,
        topic: impl Into<String>,
        listener: Option<BroadcastListener>,
    ) {
        self.notify(Command::SetBroadcastListener {
            topic: topic.into(),
            listener,
        });
    }

    /// Register the listener for responses nobody claimed. `None` removes it.
    pub fn set_unhandled_response_listener(&self, listener: Option<UnhandledResponseListener>) {
        self.notify(Command::SetUnhandledResponseListener(listener));
    }

    /// Register the listener for close events. `None` removes it.
    pub fn set_closed_listener(&self, listener: Option<ClosedListener>) {
        self.notify(Command::SetClosedListener(listener));
    }

    /// Register the listener for transport errors. `None` restores the
    /// default, which logs.
    pub fn set_error_listener(&self, listener: Option<ErrorListener>) {
        self.notify(Command::SetErrorListener(listener));
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status transition.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Number of requests sent and still waiting for a response.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Shutdown`] once the client has shut down.
    pub async fn pending_requests(&self) -> Result<usize> {
        self.call(Command::PendingRequests).await
    }

    /// Stop the connection task.
    ///
    /// Timers and scheduled reconnects are cancelled, the socket is closed and
    /// every outstanding request is rejected with [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.call(Command::Shutdown).await;
    }
}

/// Builder for [`Client`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    address: Option<String>,
    connector: Option<Arc<dyn Connector>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Set the address to connect to.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Use a specific transport.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable or disable diagnostic logging.
    #[must_use]
    pub fn enable_logging(mut self, enable: bool) -> Self {
        self.config.enable_logging = enable;
        self
    }

    /// Set the heartbeat interval. Zero disables probing.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the reconnection backoff. Both zero disables reconnection.
    #[must_use]
    pub fn retry_waiting_time(mut self, start: Duration, step: Duration) -> Self {
        self.config.retry_waiting_time_start = start;
        self.config.retry_waiting_time_step = step;
        self
    }

    /// Set the idle time before an automatic clean close. Zero disables it.
    #[must_use]
    pub fn auto_disconnect_after(mut self, idle: Duration) -> Self {
        self.config.auto_disconnect_after = idle;
        self
    }

    /// Whether in-flight requests are rejected when the connection closes.
    #[must_use]
    pub fn fail_pending_on_close(mut self, fail: bool) -> Self {
        self.config.fail_pending_on_close = fail;
        self
    }

    /// Spawn the connection task and return its handle.
    ///
    /// No socket is opened until [`Client::connect`] or [`Client::fetch`] is
    /// called. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Config`] if no address was set, or if no connector
    /// was set and the `websocket` feature is disabled.
    pub fn build(self) -> Result<Client> {
        let address = self
            .address
            .ok_or_else(|| Error::Config("address is required".to_string()))?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };

        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let manager = ConnectionManager::new(address, connector, self.config, status_tx);
        tokio::spawn(manager.run(commands_rx));

        Ok(Client { commands, status })
    }
}

#[cfg(feature = "websocket")]
#[allow(clippy::unnecessary_wraps)]
fn default_connector() -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(proven_socket_ws::WebSocketConnector::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_connector() -> Result<Arc<dyn Connector>> {
    Err(Error::Config(
        "a connector is required without the websocket feature".to_string(),
    ))
}
