use std::sync::Arc;

use failover_proxy::config::HOSTS_FILE;
use failover_proxy::shutdown::{self, shutdown_signal};
use failover_proxy::{
    build_https_client, server, spawn_workers, BackendPool, Config, EventLog, EventSink,
    HostResolver, ProxyWorker, RequestQueue,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable naming an optional YAML configuration file.
const CONFIG_FILE_ENV: &str = "PROXY_CONFIG";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var(CONFIG_FILE_ENV) {
        Ok(path) => Config::load_from_file(&path),
        Err(_) => Ok(Config::from_env()),
    }
    .and_then(|c| c.into_runtime())
    .unwrap_or_else(|e| {
        error!(error = %e, "fatal");
        std::process::exit(1);
    });

    if config.append_hosts_file {
        if let Err(e) = config.append_hosts_entries(HOSTS_FILE) {
            warn!(error = %e, path = HOSTS_FILE, "failed to update hosts file");
        }
    }

    let (trigger, shutdown) = shutdown::channel();
    let client = build_https_client(HostResolver::from_hosts(&config.hosts));

    let pool = Arc::new(BackendPool::from_config(&config));
    let poller = tokio::spawn(Arc::clone(&pool).run(client.clone(), shutdown.clone()));

    info!(
        hosts = pool.hosts().len(),
        window_secs = config.startup_timeout.as_secs(),
        "waiting for a backend to answer its probe"
    );
    if let Err(e) = pool.wait_for_startup(config.startup_timeout).await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }

    let listener = server::bind(config.listen).await.unwrap_or_else(|e| {
        error!(error = %e, "fatal");
        std::process::exit(1);
    });

    let queue = Arc::new(RequestQueue::with_capacity(config.queue_capacity));
    let mut worker = ProxyWorker::new(
        Arc::clone(&queue),
        Arc::clone(&pool),
        client,
        config.request_timeout,
    );

    let event_log = config.event_log_path.as_ref().map(|path| {
        let log = EventLog::new(path);
        let handle = log.spawn(shutdown.clone());
        (log, handle)
    });
    if let Some((log, _)) = &event_log {
        worker = worker.with_events(Arc::new(log.clone()) as Arc<dyn EventSink>);
    }

    let workers = spawn_workers(worker, config.workers, &shutdown);
    info!(workers = config.workers, addr = %config.listen, "proxy ready");

    server::serve(listener, Arc::clone(&queue), config.debug, async {
        shutdown_signal().await;
        trigger.trigger();
    })
    .await;

    trigger.trigger();
    queue.close();
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "worker task failed");
        }
    }
    if let Err(e) = poller.await {
        warn!(error = %e, "poller task failed");
    }
    if let Some((_, handle)) = event_log {
        if let Err(e) = handle.await {
            warn!(error = %e, "event log task failed");
        }
    }
    info!("proxy stopped");
}
