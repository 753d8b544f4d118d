//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backends that count their hits, pool and
//! worker builders, and utility functions used across all integration
//! test modules.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use failover_proxy::{
    build_client, BackendConnector, BackendHost, BackendPool, EventSink, HostResolver, HttpClient,
    PollSettings, ProxyWorker, RequestData, RequestQueue,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A running local backend. Dropping it shuts the backend down.
pub struct TestBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    _shutdown: oneshot::Sender<()>,
}

impl TestBackend {
    /// Number of requests this backend has received.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_client() -> HttpClient {
    build_client(HostResolver::new())
}

async fn spawn_backend<F, Fut>(handler: F) -> TestBackend
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let (tx, rx) = oneshot::channel::<()>();
    let hits = Arc::new(AtomicUsize::new(0));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let handler = Arc::clone(&handler);
                    let counter = Arc::clone(&counter);
                    let service = service_fn(move |req: Request<Incoming>| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let handler = Arc::clone(&handler);
                        async move { Ok::<_, std::convert::Infallible>(handler(req).await) }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    TestBackend {
        addr,
        hits,
        _shutdown: tx,
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Full::new(body.into()))
        .expect("test response must build")
}

/// Starts a backend that answers every request with the given status,
/// content-type and body.
pub async fn start_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> TestBackend {
    spawn_backend(move |_req: Request<Incoming>| async move { respond(status, content_type, body) })
        .await
}

/// Starts a backend that echoes the request line, the sorted request
/// headers and the body, one per line.
pub async fn start_echo_backend() -> TestBackend {
    spawn_backend(|req: Request<Incoming>| async move {
        let (parts, body) = req.into_parts();
        let mut lines: Vec<String> = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| format!("{}: {}", name.as_str(), v))
            })
            .collect();
        lines.sort();

        let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
        let text = format!(
            "{} {}\n{}\nbody: {}",
            parts.method,
            parts.uri,
            lines.join("\n"),
            String::from_utf8_lossy(&body)
        );
        respond(StatusCode::OK, "text/plain; charset=utf-8", text)
    })
    .await
}

/// Starts a backend that sleeps for the given duration before answering
/// 200 `slow`.
pub async fn start_slow_backend(delay: Duration) -> TestBackend {
    spawn_backend(move |_req: Request<Incoming>| async move {
        tokio::time::sleep(delay).await;
        respond(StatusCode::OK, "text/plain", "slow")
    })
    .await
}

/// Starts a raw TCP backend that announces a 100-byte body, sends three
/// bytes of it and then holds the connection open without sending more.
pub async fn start_stalling_backend() -> TestBackend {
    let (tx, rx) = oneshot::channel::<()>();
    let hits = Arc::new(AtomicUsize::new(0));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (mut stream, _) = result.expect("accept failed");
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        let _ = stream.read(&mut buf).await;
                        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 100\r\n\r\nabc";
                        let _ = stream.write_all(head.as_bytes()).await;
                        let _ = stream.flush().await;
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    TestBackend {
        addr,
        hits,
        _shutdown: tx,
    }
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind probe socket");
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn backend_host(addr: SocketAddr, probe_path: Option<&str>) -> Arc<BackendHost> {
    Arc::new(BackendHost::new(&format!("http://{addr}"), probe_path, None).unwrap())
}

pub fn poll_settings() -> PollSettings {
    PollSettings {
        threshold: 0.8,
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(500),
        concurrent: false,
    }
}

/// A pool whose active set is `addrs`, ranked in the given order.
pub fn ranked_pool(addrs: &[SocketAddr]) -> Arc<BackendPool> {
    let hosts: Vec<_> = addrs
        .iter()
        .enumerate()
        .map(|(rank, addr)| {
            let host = backend_host(*addr, None);
            (0..10).for_each(|_| host.add_success(true));
            host.add_latency(10.0 * (rank + 1) as f64);
            host
        })
        .collect();

    let pool = BackendPool::new(hosts, poll_settings());
    pool.refresh_active();
    Arc::new(pool)
}

/// A worker over `pool` with its own, unused queue.
pub fn test_worker(pool: Arc<BackendPool>, timeout: Duration) -> ProxyWorker<BackendConnector> {
    worker_with_client(pool, test_client(), timeout)
}

pub fn worker_with_client(
    pool: Arc<BackendPool>,
    client: HttpClient,
    timeout: Duration,
) -> ProxyWorker<BackendConnector> {
    ProxyWorker::new(Arc::new(RequestQueue::unbounded()), pool, client, timeout)
}

/// Runs `req` through `worker` and returns the client-facing response.
pub async fn proxy_request<B>(
    worker: &ProxyWorker<BackendConnector>,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<failover_proxy::StdError>,
{
    let (data, rx) = RequestData::new(req, false);
    worker.handle(data).await;
    rx.await.expect("worker must answer")
}

pub fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Collects a response body into [`Bytes`].
pub async fn collect_body(body: Full<Bytes>) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// [`EventSink`] that keeps every line in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<serde_json::Value> {
        self.lines()
            .iter()
            .map(|line| serde_json::from_str(line).expect("event must be JSON"))
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn send(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }
}
