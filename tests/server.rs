//! End-to-end tests: client -> listener -> queue -> workers -> backend.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use failover_proxy::shutdown::{self, ShutdownTrigger};
use failover_proxy::{server, spawn_workers, BackendPool, RequestQueue};
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct TestProxy {
    addr: SocketAddr,
    trigger: ShutdownTrigger,
    server: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

async fn start_proxy(pool: Arc<BackendPool>, capacity: Option<usize>, workers: usize) -> TestProxy {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind proxy");
    let addr = listener.local_addr().unwrap();

    let (trigger, signal) = shutdown::channel();
    let queue = Arc::new(RequestQueue::with_capacity(capacity));
    let worker = failover_proxy::ProxyWorker::new(
        Arc::clone(&queue),
        pool,
        test_client(),
        Duration::from_secs(2),
    );
    let workers = spawn_workers(worker, workers, &signal);

    let server = tokio::spawn({
        let signal = signal.clone();
        async move {
            server::serve(listener, queue, false, async move { signal.cancelled().await }).await;
        }
    });

    TestProxy {
        addr,
        trigger,
        server,
        workers,
    }
}

async fn send(addr: SocketAddr, path: &str) -> (StatusCode, Bytes) {
    let req = Request::get(format!("http://{addr}{path}"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = test_client().request(req).await.expect("proxy must answer");
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

#[tokio::test]
async fn requests_flow_through_queue_and_workers() {
    init_tracing();
    let backend = start_backend(StatusCode::OK, "text/plain", "hello from backend").await;
    let proxy = start_proxy(ranked_pool(&[backend.addr]), None, 2).await;

    let (status, body) = send(proxy.addr, "/greeting").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"hello from backend"));
    assert_eq!(backend.hits(), 1);
}

#[tokio::test]
async fn health_endpoint_is_served_over_http() {
    init_tracing();
    let backend = start_backend(StatusCode::OK, "text/plain", "unused").await;
    let proxy = start_proxy(ranked_pool(&[backend.addr]), None, 1).await;

    let (status, body) = send(proxy.addr, "/health").await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("UP"));
    assert!(text.contains(&backend.url()));
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn concurrent_requests_are_each_answered_once() {
    init_tracing();
    let backend = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let proxy = start_proxy(ranked_pool(&[backend.addr]), None, 4).await;

    let requests: Vec<_> = (0..20)
        .map(|i| {
            let addr = proxy.addr;
            tokio::spawn(async move { send(addr, &format!("/item/{i}")).await })
        })
        .collect();

    for request in requests {
        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"ok"));
    }
    assert_eq!(backend.hits(), 20);
}

#[tokio::test]
async fn per_host_accounting_matches_attempts_across_workers() {
    init_tracing();
    const REQUESTS: usize = 30;
    let failing = start_backend(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "busy").await;
    let healthy = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let pool = ranked_pool(&[failing.addr, healthy.addr]);
    let proxy = start_proxy(Arc::clone(&pool), None, 6).await;

    let requests: Vec<_> = (0..REQUESTS)
        .map(|i| {
            let addr = proxy.addr;
            tokio::spawn(async move { send(addr, &format!("/order/{i}")).await })
        })
        .collect();

    for request in requests {
        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"ok"));
    }

    let hosts = pool.hosts();
    assert_eq!(failing.hits(), REQUESTS);
    assert_eq!(hosts[0].error_count(), failing.hits() as u64);
    assert!(hosts[0].proxy_latency_samples().is_empty());
    assert_eq!(healthy.hits(), REQUESTS);
    assert_eq!(hosts[1].error_count(), 0);
    assert_eq!(hosts[1].proxy_latency_samples().len(), REQUESTS.min(50));
}

#[tokio::test]
async fn full_queue_rejects_with_service_unavailable() {
    init_tracing();
    let backend = start_backend(StatusCode::OK, "text/plain", "ok").await;
    // No workers: the first request occupies the only queue slot.
    let proxy = start_proxy(ranked_pool(&[backend.addr]), Some(1), 0).await;

    let addr = proxy.addr;
    let _parked = tokio::spawn(async move { send(addr, "/first").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, body) = send(proxy.addr, "/second").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, Bytes::from_static(b"Service Unavailable"));
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn shutdown_stops_listener_and_workers() {
    init_tracing();
    let backend = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let proxy = start_proxy(ranked_pool(&[backend.addr]), None, 3).await;

    let (status, _) = send(proxy.addr, "/before").await;
    assert_eq!(status, StatusCode::OK);

    proxy.trigger.trigger();

    tokio::time::timeout(Duration::from_secs(2), proxy.server)
        .await
        .expect("listener should stop")
        .unwrap();
    for worker in proxy.workers {
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
