//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Literal body returned when every active backend failed a request.
pub const NO_ACTIVE_HOSTS_BODY: &str = "No active hosts were able to handle the request.";

/// Every failure the proxy can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum ProxyError {
    /// The configuration could not be loaded or is semantically invalid.
    Config(String),
    /// A backend hostname could not be parsed into scheme, host and port.
    InvalidHost(String),
    /// A literal IP override is not a valid address.
    InvalidAddress(String),
    /// The listen socket could not be bound.
    Bind(std::io::Error),
    /// No backend answered a probe within the startup grace period.
    StartupTimeout(Duration),
    /// The intake queue is full or closed.
    QueueFull,
    /// The inbound request could not be read.
    BadRequest(String),
    /// A backend could not be reached or the exchange failed mid-flight.
    Upstream(String),
    /// A backend did not answer within the per-call timeout.
    Timeout(Duration),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidHost(msg) => write!(f, "invalid host: {msg}"),
            Self::InvalidAddress(msg) => write!(f, "invalid address: {msg}"),
            Self::Bind(e) => write!(f, "failed to bind listener: {e}"),
            Self::StartupTimeout(window) => write!(
                f,
                "no backend answered a probe within {}s",
                window.as_secs()
            ),
            Self::QueueFull => write!(f, "request queue is full"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Self::Timeout(after) => write!(f, "upstream timed out after {after:?}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(e) => Some(e),
            _ => None,
        }
    }
}

impl ProxyError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_)
            | Self::InvalidHost(_)
            | Self::InvalidAddress(_)
            | Self::Bind(_)
            | Self::StartupTimeout(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Fixed plain-text body sent to the client for this error.
    ///
    /// Internal details are logged, never echoed to clients.
    pub fn client_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::SERVICE_UNAVAILABLE => "Service Unavailable",
            StatusCode::BAD_GATEWAY => NO_ACTIVE_HOSTS_BODY,
            StatusCode::GATEWAY_TIMEOUT => "Gateway Timeout",
            _ => "Internal Server Error",
        }
    }

    /// Converts this error into a plain-text HTTP response.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        plain_response(self.status_code(), self.client_message())
    }
}

/// Builds a `Connection: close` plain-text response.
pub(crate) fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    headers.insert(
        hyper::header::CONNECTION,
        hyper::header::HeaderValue::from_static("close"),
    );
    response
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
