//! Wire frames exchanged over the socket.
//!
//! Every frame is UTF-8 text. Frames starting with [`CONTROL_PREFIX`] are
//! control tokens (heartbeat); everything else is a JSON object, either a
//! request (client to peer) or a response envelope (peer to client).

use crate::error::{Error, Result};

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Leading character reserved for control tokens.
pub const CONTROL_PREFIX: char = '$';

/// Liveness probe.
pub const PING: &str = "$PING";

/// Answer to a liveness probe.
pub const PONG: &str = "$PONG";

/// Keys the client owns in a request frame.
const RESERVED_KEYS: [&str; 5] = ["id", "path", "method", "headers", "body"];

/// Options for a single fetch call.
///
/// Extra keys are copied verbatim into the request frame, except for the
/// ones the client itself writes.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FetchOptions {
    /// Request method, `GET` by default.
    #[serde(with = "http_serde::method")]
    pub method: Method,

    /// Request headers.
    #[serde(with = "http_serde::header_map", skip_serializing_if = "HeaderMap::is_empty")]
    pub headers: HeaderMap,

    /// JSON body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    /// Additional top-level keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FetchOptions {
    /// Options for a `GET` request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the JSON body.
    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add an extra top-level key to the request frame.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    fn strip_reserved(&mut self) {
        self.extra
            .retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));
    }
}

/// An outgoing request frame.
#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub id: String,
    pub path: String,
    #[serde(flatten)]
    pub options: FetchOptions,
}

impl Request {
    pub fn new(id: String, path: String, mut options: FetchOptions) -> Self {
        options.strip_reserved();
        Self { id, path, options }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Encode(e.to_string()))
    }
}

/// A response envelope from the peer.
///
/// Both `id` and `status` must be present for a frame to be accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request, or the topic of a broadcast.
    pub id: String,

    /// HTTP-style status code.
    pub status: u16,

    /// Payload, `null` when absent.
    #[serde(default)]
    pub body: Value,
}

impl Response {
    /// Whether the status is in `[200, 300)` or is `304`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }

    /// Deserialize the body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.body).map_err(|e| Error::MalformedResponse(e.to_string()))
    }
}

/// Classification of an inbound text frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Inbound {
    Ping,
    Pong,
    /// Any other control token; never dispatched.
    Control(String),
    Response(Response),
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self> {
        if text.starts_with(CONTROL_PREFIX) {
            return Ok(match text {
                PING => Self::Ping,
                PONG => Self::Pong,
                other => Self::Control(other.to_string()),
            });
        }

        serde_json::from_str(text)
            .map(Self::Response)
            .map_err(|e| Error::MalformedResponse(e.to_string()))
    }
}
