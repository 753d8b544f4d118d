//! Listener: accepts connections and feeds the request queue.
//!
//! The accept loop never proxies anything itself. Each request on an
//! accepted connection becomes a [`RequestData`] pushed onto the shared
//! [`RequestQueue`]; the connection task then waits on the record's
//! one-shot channel for whatever a worker (or the record's drop guard)
//! sends back.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::plain_response;
use crate::queue::RequestQueue;
use crate::request::{ClientResponse, RequestData};
use crate::{ProxyError, Result};

/// Binds the listen socket.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(ProxyError::Bind)?;
    info!(addr = %addr, "listening");
    Ok(listener)
}

/// Turns one inbound request into a queue entry and waits for its answer.
async fn enqueue(
    req: hyper::Request<Incoming>,
    queue: &RequestQueue<RequestData>,
    debug: bool,
) -> ClientResponse {
    let (data, rx) = RequestData::new(req, debug);
    if let Err(mut rejected) = queue.push(data) {
        warn!(
            id = rejected.id,
            queued = queue.len(),
            closed = queue.is_closed(),
            "request queue rejected request"
        );
        rejected.respond(ProxyError::QueueFull.into_response());
    }

    rx.await.unwrap_or_else(|_| {
        plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    })
}

/// Accepts connections on `listener` and queues every request for the
/// workers. `debug` turns on debug logging for every request.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. Connections already accepted finish on their own tasks.
pub async fn serve(
    listener: TcpListener,
    queue: Arc<RequestQueue<RequestData>>,
    debug: bool,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };
                debug!(client = %client_addr, "accepted connection");

                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let queue = Arc::clone(&queue);
                        async move { Ok::<_, Infallible>(enqueue(req, &queue, debug).await) }
                    });

                    let result = http1::Builder::new()
                        .keep_alive(false)
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;

                    if let Err(e) = result {
                        warn!(%e, client = %client_addr, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}
