//! Per-request records passed from the listener to a worker.
//!
//! A [`RequestData`] owns the inbound request and the one-shot channel its
//! response must be sent on. It answers exactly once: either through
//! [`RequestData::respond`], or, if it is dropped unanswered on any path
//! (an early return, an error, a panicking handler), with a 500 from its
//! `Drop` impl.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode, Uri};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{plain_response, NO_ACTIVE_HOSTS_BODY};
use crate::{BoxBody, ProxyError, Result, StdError};

/// Header that switches a single request into debug logging.
pub const DEBUG_HEADER: &str = "x-proxy-debug";

/// Older clients' name for [`DEBUG_HEADER`]. Unlike it, this one is
/// forwarded to backends.
pub const LEGACY_DEBUG_HEADER: &str = "s7pdebug";

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Response type written back to clients.
pub type ClientResponse = Response<Full<Bytes>>;

/// One inbound HTTP exchange waiting to be handled by a worker.
pub struct RequestData {
    pub id: u64,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    body: Option<BoxBody>,
    /// Wall-clock arrival time, used in events.
    pub received_at: SystemTime,
    /// Monotonic arrival time, used for durations.
    pub received: Instant,
    pub debug: bool,
    responder: Option<oneshot::Sender<ClientResponse>>,
}

impl RequestData {
    /// Wraps `req`, returning the record and the receiver its response
    /// will arrive on.
    pub fn new<B>(req: Request<B>, debug: bool) -> (Self, oneshot::Receiver<ClientResponse>)
    where
        B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<StdError>,
    {
        let (tx, rx) = oneshot::channel();
        let (parts, body) = req.into_parts();

        let debug = debug
            || [DEBUG_HEADER, LEGACY_DEBUG_HEADER].iter().any(|name| {
                parts
                    .headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
            });

        let data = Self {
            id: REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body: Some(body.map_err(|e| e.into()).boxed()),
            received_at: SystemTime::now(),
            received: Instant::now(),
            debug,
            responder: Some(tx),
        };
        (data, rx)
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path and query, as forwarded to backends.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    /// Reads the whole request body into memory. Subsequent calls return
    /// an empty body.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        match self.body.take() {
            Some(body) => body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| ProxyError::BadRequest(format!("failed to read request body: {e}"))),
            None => Ok(Bytes::new()),
        }
    }

    pub fn is_answered(&self) -> bool {
        self.responder.is_none()
    }

    /// Sends the response to the client. Only the first call has an
    /// effect; later calls return `false`.
    pub fn respond(&mut self, response: ClientResponse) -> bool {
        match self.responder.take() {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!(id = self.id, "client went away before the response was ready");
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for RequestData {
    fn drop(&mut self) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
            ));
        }
    }
}

impl std::fmt::Debug for RequestData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestData")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("debug", &self.debug)
            .field("answered", &self.is_answered())
            .finish_non_exhaustive()
    }
}

/// The result of a proxy attempt, ready to be written to the client.
#[derive(Debug, Clone)]
pub struct ProxyData {
    pub status: StatusCode,
    /// Response headers other than `content-*`.
    pub headers: HeaderMap,
    /// `content-*` response headers.
    pub content_headers: HeaderMap,
    pub body: Bytes,
    /// Backend URL the request was sent to; empty for the fallback.
    pub full_url: String,
    pub responded_at: SystemTime,
}

impl ProxyData {
    /// Splits `headers` into regular and `content-*` headers.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, full_url: String) -> Self {
        let (content_headers, headers) = crate::headers::split_content_headers(headers);
        Self {
            status,
            headers,
            content_headers,
            body,
            full_url,
            responded_at: SystemTime::now(),
        }
    }

    /// The 502 returned when no active backend produced a response.
    pub fn no_active_hosts() -> Self {
        let mut content_headers = HeaderMap::new();
        content_headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain"),
        );
        Self {
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderMap::new(),
            content_headers,
            body: Bytes::from_static(NO_ACTIVE_HOSTS_BODY.as_bytes()),
            full_url: String::new(),
            responded_at: SystemTime::now(),
        }
    }
}
