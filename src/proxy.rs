//! Proxy workers: the failover loop and response writing.
//!
//! A fixed number of [`ProxyWorker`]s pull [`RequestData`] off the shared
//! queue. For each request a worker buffers the body once, takes the
//! current active-host snapshot, and tries the hosts best first. A 3xx or
//! 5xx answer, a transport error or a timeout moves on to the next host;
//! any other answer is returned to the client as-is. When every host has
//! been tried the client gets a fixed 502.
//!
//! Every request is handled on its own task inside a
//! `tracing::info_span!("request", ...)` carrying the request id.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::dns::HostResolver;
use crate::pool::BackendPool;
use crate::queue::RequestQueue;
use crate::request::{ClientResponse, ProxyData, RequestData};
use crate::shutdown::Shutdown;
use crate::telemetry::{iso8601, EventRecord, EventSink, Telemetry, TracingTelemetry};
use crate::upstream::BackendHost;
use crate::{headers, tls, ProxyError, Result};

/// Path answered by the proxy itself with the host status report.
pub const HEALTH_PATH: &str = "/health";

/// Connector used for plain TCP backend connections.
pub type BackendConnector = HttpConnector<HostResolver>;

/// The HTTP client type for plain TCP backend connections.
pub type HttpClient = Client<BackendConnector, Full<Bytes>>;

/// The HTTPS client type, able to reach both `http://` and `https://`
/// backends.
pub type HttpsClient = Client<hyper_rustls::HttpsConnector<BackendConnector>, Full<Bytes>>;

/// Constructs a new [`HttpClient`] resolving names through `resolver`.
/// Outbound requests carry `Connection: close`, so no idle connections
/// are kept.
pub fn build_client(resolver: HostResolver) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(0)
        .build(HttpConnector::new_with_resolver(resolver))
}

/// Constructs a new [`HttpsClient`] verifying backends against the
/// Mozilla root store.
pub fn build_https_client(resolver: HostResolver) -> HttpsClient {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(0)
        .build(tls::build_https_connector(resolver))
}

/// Returns `true` for backend answers that trigger failover: redirects
/// and server errors. Everything else is the authoritative answer.
pub fn should_fail_over(status: StatusCode) -> bool {
    status.is_redirection() || status.as_u16() >= 500
}

/// Rewrites the original request URI to target `base`, preserving the
/// path and query string.
fn rewrite_uri(original: &Uri, base: &str) -> Result<Uri> {
    let base: Uri = base
        .parse()
        .map_err(|e| ProxyError::Internal(format!("invalid backend base URL {base}: {e}")))?;

    let authority = base
        .authority()
        .ok_or_else(|| ProxyError::Internal("backend has no authority".into()))?;
    let scheme = base
        .scheme()
        .ok_or_else(|| ProxyError::Internal("backend has no scheme".into()))?;

    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build backend URI: {e}")))
}

/// One member of the worker pool. Cheap to clone; all clones share the
/// queue, the backend pool and the HTTP client.
pub struct ProxyWorker<C> {
    queue: Arc<RequestQueue<RequestData>>,
    pool: Arc<BackendPool>,
    client: Client<C, Full<Bytes>>,
    request_timeout: Duration,
    telemetry: Arc<dyn Telemetry>,
    events: Option<Arc<dyn EventSink>>,
}

impl<C: Clone> Clone for ProxyWorker<C> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            pool: Arc::clone(&self.pool),
            client: self.client.clone(),
            request_timeout: self.request_timeout,
            telemetry: Arc::clone(&self.telemetry),
            events: self.events.clone(),
        }
    }
}

impl<C> ProxyWorker<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    pub fn new(
        queue: Arc<RequestQueue<RequestData>>,
        pool: Arc<BackendPool>,
        client: Client<C, Full<Bytes>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            pool,
            client,
            request_timeout,
            telemetry: Arc::new(TracingTelemetry),
            events: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Handles queued requests until `shutdown` fires or the queue is
    /// closed and drained. Requests already queued are served first.
    pub async fn run(self, worker: usize, shutdown: Shutdown) {
        debug!(worker, "proxy worker started");
        loop {
            let request = tokio::select! {
                biased;
                item = self.queue.pop() => match item {
                    Some(request) => request,
                    None => break,
                },
                () = shutdown.cancelled() => break,
            };

            let id = request.id;
            let this = self.clone();
            let handled = tokio::spawn(async move { this.handle(request).await });
            if let Err(e) = handled.await {
                error!(worker, request = id, error = %e, "request handler failed");
                self.telemetry.track_exception(&e);
            }
        }
        debug!(worker, "proxy worker stopped");
    }

    /// Serves one request and answers its client.
    pub async fn handle(&self, mut request: RequestData) {
        let span = tracing::info_span!(
            "request",
            id = request.id,
            method = %request.method,
            path = %request.path(),
        );

        async move {
            if request.path() == HEALTH_PATH {
                request.respond(self.health_response());
                return;
            }

            let data = match self.proxy(&mut request).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "request failed");
                    self.telemetry.track_exception(&e);
                    request.respond(e.into_response());
                    return;
                }
            };

            let status = data.status;
            let duration = request.received.elapsed();
            // The fallback was served by no backend; report the request path.
            let url = if data.full_url.is_empty() {
                request.path_and_query()
            } else {
                data.full_url.as_str()
            };
            self.emit(EventRecord::completed(
                url,
                status,
                request.received_at,
                data.responded_at,
            ));
            info!(
                status = status.as_u16(),
                upstream = %data.full_url,
                bytes = data.body.len(),
                latency_ms = duration.as_millis() as u64,
                "request completed"
            );

            let response = write_response(data);
            self.telemetry.track_request(
                &format!("{} {}", request.method, request.path()),
                request.received_at,
                duration,
                status,
                status.as_u16() < 500,
            );
            request.respond(response);
        }
        .instrument(span)
        .await
    }

    fn health_response(&self) -> ClientResponse {
        let mut response = Response::new(Full::new(Bytes::from(self.pool.status_report())));
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        response
    }

    /// Runs the failover loop for `request`.
    ///
    /// Only reading the client's body can fail; backend failures are
    /// absorbed and end in [`ProxyData::no_active_hosts`] when no host
    /// produced an answer.
    pub async fn proxy(&self, request: &mut RequestData) -> Result<ProxyData> {
        let body = request.read_body().await?;
        let hosts = self.pool.active_hosts();
        if hosts.is_empty() {
            warn!("no active hosts");
        }

        for host in hosts.iter() {
            match self.attempt(request, host, body.clone()).await {
                Ok(data) => return Ok(data),
                Err(e) => self.record_failure(request, host, &e),
            }
        }

        Ok(ProxyData::no_active_hosts())
    }

    /// Sends `request` to a single host. Any `Err` means "try the next
    /// host".
    async fn attempt(
        &self,
        request: &RequestData,
        host: &BackendHost,
        body: Bytes,
    ) -> Result<ProxyData> {
        let uri = rewrite_uri(&request.uri, host.url())?;
        let full_url = format!("{}{}", host.url(), request.path_and_query());

        let mut outbound = Request::new(Full::new(body.clone()));
        *outbound.method_mut() = request.method.clone();
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = headers::outbound_headers(&request.headers, host.host(), body.len());

        if request.debug {
            info!(
                upstream = %full_url,
                bytes = body.len(),
                headers = ?outbound.headers(),
                "> {} {}",
                request.method,
                full_url
            );
        }

        // The timeout covers the whole exchange, body included.
        let start = Instant::now();
        let exchange = async {
            let response = self.client.request(outbound).await?;
            if should_fail_over(response.status()) {
                return Ok((response.into_parts().0, None));
            }

            let (parts, incoming) = response.into_parts();
            let body = incoming
                .collect()
                .await
                .map_err(|e| ProxyError::Upstream(format!("failed to read backend body: {e}")))?
                .to_bytes();
            Ok::<_, ProxyError>((parts, Some(body)))
        };

        let (parts, body) = match timeout(self.request_timeout, exchange).await {
            Ok(result) => result?,
            Err(_elapsed) => return Err(ProxyError::Timeout(self.request_timeout)),
        };

        let status = parts.status;
        let Some(body) = body else {
            if request.debug {
                info!(upstream = %full_url, status = status.as_u16(), "trying next host");
            }
            return Err(ProxyError::Upstream(format!(
                "{} answered {status}",
                host.url()
            )));
        };

        host.add_proxy_latency(start.elapsed().as_secs_f64() * 1_000.0);

        if request.debug {
            info!(
                upstream = %full_url,
                status = status.as_u16(),
                bytes = body.len(),
                headers = ?parts.headers,
                "< response"
            );
        }

        let data = ProxyData::new(status, parts.headers, body, full_url);
        self.check_charset(request, &data);
        Ok(data)
    }

    /// Logs an unrecognised response charset. The body is forwarded
    /// unchanged and treated as UTF-8.
    fn check_charset(&self, request: &RequestData, data: &ProxyData) {
        let charset = data
            .content_headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(headers::charset);

        match charset {
            Some(charset) if !headers::is_known_charset(&charset) => {
                warn!(charset = %charset, upstream = %data.full_url, "unsupported charset, assuming utf-8");
                self.emit(EventRecord::failed(
                    &data.full_url,
                    request.received_at,
                    format!("Unsupported charset: {charset}"),
                ));
            }
            Some(_) => {}
            None if request.debug => info!("no charset specified, using default utf-8"),
            None => {}
        }
    }

    fn record_failure(&self, request: &RequestData, host: &BackendHost, error: &ProxyError) {
        host.add_error();
        let url = format!("{}{}", host.url(), request.path_and_query());
        warn!(
            upstream = %host,
            error = %error,
            errors = host.error_count(),
            latency_ms = request.received.elapsed().as_millis() as u64,
            "proxy attempt failed"
        );

        self.telemetry.track_exception(error);
        self.telemetry.track_event(
            "ProxyRequest",
            &[
                ("URL", url.clone()),
                ("RequestDate", iso8601(request.received_at)),
                ("ResponseDate", iso8601(SystemTime::now())),
                ("StatusCode", error.status_code().as_u16().to_string()),
            ],
        );
        self.emit(EventRecord::failed(&url, request.received_at, error.to_string()));
    }

    fn emit(&self, record: EventRecord) {
        if let Some(events) = &self.events {
            events.send(record.to_line());
        }
    }
}

/// Spawns `count` workers sharing `worker`'s queue, pool and client.
pub fn spawn_workers<C>(worker: ProxyWorker<C>, count: usize, shutdown: &Shutdown) -> Vec<JoinHandle<()>>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    (0..count)
        .map(|id| tokio::spawn(worker.clone().run(id, shutdown.clone())))
        .collect()
}

/// Builds the client-facing response from a proxy result.
///
/// Hop-by-hop headers are dropped, `Content-Length` is set from the body
/// and every other header is copied verbatim.
pub fn write_response(data: ProxyData) -> ClientResponse {
    let ProxyData {
        status,
        headers: mut regular,
        content_headers,
        body,
        ..
    } = data;

    headers::strip_hop_by_hop(&mut regular);

    let mut response = Response::new(Full::new(body.clone()));
    *response.status_mut() = status;
    let out = response.headers_mut();
    *out = regular;

    for (name, value) in content_headers.iter() {
        if name != header::CONTENT_LENGTH {
            out.append(name.clone(), value.clone());
        }
    }
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    out.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

#[cfg(test)]
mod tests {
    use hyper::header::HeaderMap;

    use super::*;

    fn parse_uri(uri: &str) -> Uri {
        uri.parse::<Uri>().expect("failed to parse URI")
    }

    #[test]
    fn rewrite_uri_preserves_path_and_query() {
        let original = parse_uri("http://client-facing.com/api/v1?key=val");

        let result = rewrite_uri(&original, "http://localhost:3000").unwrap();
        assert_eq!(result.scheme_str(), Some("http"));
        assert_eq!(result.authority().unwrap().as_str(), "localhost:3000");
        assert_eq!(result.path_and_query().unwrap().as_str(), "/api/v1?key=val");
    }

    #[test]
    fn rewrite_uri_defaults_to_root_path() {
        let original = parse_uri("http://client-facing.com");

        let result = rewrite_uri(&original, "https://10.0.0.5:8443").unwrap();
        assert_eq!(result.to_string(), "https://10.0.0.5:8443/");
    }

    #[test]
    fn redirects_and_server_errors_fail_over() {
        assert!(should_fail_over(StatusCode::MOVED_PERMANENTLY));
        assert!(should_fail_over(StatusCode::TEMPORARY_REDIRECT));
        assert!(should_fail_over(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_fail_over(StatusCode::SERVICE_UNAVAILABLE));

        assert!(!should_fail_over(StatusCode::OK));
        assert!(!should_fail_over(StatusCode::NO_CONTENT));
        assert!(!should_fail_over(StatusCode::UNAUTHORIZED));
        assert!(!should_fail_over(StatusCode::FORBIDDEN));
        assert!(!should_fail_over(StatusCode::NOT_FOUND));
    }

    #[test]
    fn write_response_maps_content_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("999"));
        headers.insert("etag", HeaderValue::from_static("\"v1\""));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let data = ProxyData::new(
            StatusCode::CREATED,
            headers,
            Bytes::from_static(b"{\"ok\":true}"),
            "http://b:80/x".into(),
        );
        let response = write_response(data);

        assert_eq!(response.status(), StatusCode::CREATED);
        let out = response.headers();
        assert_eq!(out["content-type"], "application/json");
        assert_eq!(out["content-length"], "11");
        assert_eq!(out["etag"], "\"v1\"");
        assert_eq!(out["connection"], "close");
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
        assert!(!out.contains_key("keep-alive"));
    }

    #[test]
    fn fallback_response_is_plain_text_502() {
        let response = write_response(ProxyData::no_active_hosts());
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(
            response.headers()["content-length"],
            crate::error::NO_ACTIVE_HOSTS_BODY.len().to_string().as_str()
        );
    }
}
