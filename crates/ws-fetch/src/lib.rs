//! HTTP-style request/response over a single message socket.
//!
//! A [`Client`] keeps one socket open to a peer and lets callers issue
//! fetch-like requests over it. Every request carries a correlation id and is
//! completed by the response with the same id, in whatever order responses
//! arrive. Responses nobody asked for are routed to broadcast listeners by
//! topic, or to an unhandled-response listener.
//!
//! # Features
//!
//! - **Correlation**: out-of-order completion, exactly once per request
//! - **Broadcasts**: standing per-topic listeners for server-pushed messages
//! - **Heartbeat**: `$PING`/`$PONG` liveness probes while connected
//! - **Reconnection**: linear backoff after abnormal closures only
//! - **Idle disconnect**: clean close after a period without requests
//!
//! # Example
//!
//! ```no_run
//! use proven_ws_fetch::{Client, FetchOptions, Response};
//! use std::sync::Arc;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .address("ws://localhost:8080/api")
//!         .build()?;
//!
//!     client.set_broadcast_listener(
//!         "/app.messages",
//!         Some(Arc::new(|message: proven_ws_fetch::Result<Response>| {
//!             println!("broadcast: {message:?}");
//!         })),
//!     );
//!
//!     let response = client.fetch("/users/1", FetchOptions::new()).await?;
//!     println!("{}", response.body);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Log through `tracing` when the client's configuration enables logging.
macro_rules! diag {
    ($config:expr, $level:ident, $($arg:tt)+) => {
        if $config.enable_logging {
            tracing::$level!($($arg)+);
        }
    };
}

mod client;
mod config;
mod connection;
mod envelope;
mod error;
mod heartbeat;
mod id;
mod reconnect;
mod registry;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use connection::{ClosedListener, ConnectionStatus, ErrorListener};
pub use envelope::{CONTROL_PREFIX, FetchOptions, PING, PONG, Response};
pub use error::{Error, Result};
pub use registry::{BroadcastListener, UnhandledResponseListener};

// Re-export transport types that are part of our public API
pub use proven_socket::{CloseEvent, Connector, SocketError};
