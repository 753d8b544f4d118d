//! Backend pool: health polling and ranking.
//!
//! The pool probes every configured backend once per poll cycle, feeds
//! the outcome into the host's rolling windows, and publishes the ranked
//! active subset through an [`ArcSwap`]. Workers read that snapshot
//! without locking; the poll loop is its only writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::Connect;
use hyper_util::client::legacy::Client;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::shutdown::Shutdown;
use crate::upstream::BackendHost;
use crate::{ProxyError, Result};

/// A status report is logged at least this often, changed or not.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Rounds of the startup window before giving up.
const STARTUP_ROUNDS: u32 = 10;

/// How often the started flag is checked while waiting for startup.
const STARTUP_CHECK: Duration = Duration::from_secs(1);

/// Polling parameters taken from the runtime configuration.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Success-rate fraction a host must exceed to be active.
    pub threshold: f64,
    pub interval: Duration,
    pub timeout: Duration,
    pub concurrent: bool,
}

impl From<&RuntimeConfig> for PollSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            threshold: config.success_threshold,
            interval: config.poll_interval,
            timeout: config.poll_timeout,
            concurrent: config.concurrent_probes,
        }
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    /// Elapsed milliseconds; only present for successful probes.
    pub latency_ms: Option<f64>,
}

impl ProbeOutcome {
    fn failed() -> Self {
        Self {
            success: false,
            latency_ms: None,
        }
    }
}

/// All configured backends plus the currently active, ranked subset.
pub struct BackendPool {
    hosts: Vec<Arc<BackendHost>>,
    active: ArcSwap<Vec<Arc<BackendHost>>>,
    started: AtomicBool,
    settings: PollSettings,
    last_outcomes: Mutex<Vec<Option<bool>>>,
    last_report: Mutex<Option<Instant>>,
}

impl BackendPool {
    pub fn new(hosts: Vec<Arc<BackendHost>>, settings: PollSettings) -> Self {
        let count = hosts.len();
        Self {
            hosts,
            active: ArcSwap::from_pointee(Vec::new()),
            started: AtomicBool::new(false),
            settings,
            last_outcomes: Mutex::new(vec![None; count]),
            last_report: Mutex::new(None),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.hosts.clone(), PollSettings::from(config))
    }

    /// Every configured host, in configuration order.
    pub fn hosts(&self) -> &[Arc<BackendHost>] {
        &self.hosts
    }

    /// Snapshot of the active hosts, best first. Later poll cycles never
    /// modify a snapshot already handed out.
    pub fn active_hosts(&self) -> Arc<Vec<Arc<BackendHost>>> {
        self.active.load_full()
    }

    /// `true` once any probe has succeeded.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Recomputes the active set from the hosts' current statistics and
    /// publishes it.
    pub fn refresh_active(&self) {
        self.active
            .store(Arc::new(rank(&self.hosts, self.settings.threshold)));
    }

    /// Runs one poll cycle: probes every host, records the outcomes, and
    /// republishes the active set.
    ///
    /// Returns `true` if any host's probe outcome differs from the
    /// previous cycle.
    pub async fn poll_once<C>(&self, client: &Client<C, Full<Bytes>>) -> bool
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        let timeout = self.settings.timeout;
        let outcomes = if self.settings.concurrent {
            let mut set = JoinSet::new();
            for (index, host) in self.hosts.iter().enumerate() {
                let client = client.clone();
                let host = Arc::clone(host);
                set.spawn(async move { (index, probe(&client, &host, timeout).await) });
            }

            let mut outcomes = vec![ProbeOutcome::failed(); self.hosts.len()];
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, outcome)) => outcomes[index] = outcome,
                    Err(e) => warn!(error = %e, "probe task failed"),
                }
            }
            outcomes
        } else {
            let mut outcomes = Vec::with_capacity(self.hosts.len());
            for host in &self.hosts {
                outcomes.push(probe(client, host, timeout).await);
            }
            outcomes
        };

        for (host, outcome) in self.hosts.iter().zip(&outcomes) {
            self.record(host, *outcome);
        }
        self.refresh_active();

        let mut last = self
            .last_outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut changed = false;
        for (previous, outcome) in last.iter_mut().zip(&outcomes) {
            if *previous != Some(outcome.success) {
                changed = true;
                *previous = Some(outcome.success);
            }
        }
        changed
    }

    /// Applies one probe outcome to `host`.
    pub fn record(&self, host: &BackendHost, outcome: ProbeOutcome) {
        if let Some(ms) = outcome.latency_ms {
            host.add_latency(ms);
        }
        host.add_success(outcome.success);
        if outcome.success {
            self.started.store(true, Ordering::Release);
        }
    }

    /// Polls until `shutdown` fires, logging a status report whenever a
    /// host changes state and at least once a minute.
    pub async fn run<C>(self: Arc<Self>, client: Client<C, Full<Bytes>>, shutdown: Shutdown)
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        info!(
            hosts = self.hosts.len(),
            interval_ms = self.settings.interval.as_millis() as u64,
            concurrent = self.settings.concurrent,
            "backend poller started"
        );

        loop {
            let changed = tokio::select! {
                changed = self.poll_once(&client) => changed,
                () = shutdown.cancelled() => break,
            };

            if self.report_due(changed) {
                for line in self.status_report().lines() {
                    info!(target: "status", "{line}");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                () = shutdown.cancelled() => break,
            }
        }
        info!("backend poller stopped");
    }

    fn report_due(&self, changed: bool) -> bool {
        let mut last = self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let due = changed || last.map_or(true, |at| at.elapsed() >= REPORT_INTERVAL);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// One line per configured host: up/down, URL, rounded score in ms and
    /// rounded success rate in percent.
    pub fn status_report(&self) -> String {
        self.hosts
            .iter()
            .map(|host| {
                let rate = host.success_rate();
                let state = if rate > self.settings.threshold {
                    "UP  "
                } else {
                    "DOWN"
                };
                format!(
                    "{state} {} {:.0} ms {:.0}%",
                    host.url(),
                    host.average_latency(),
                    rate * 100.0
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Waits for the first successful probe.
    ///
    /// Checks once a second for up to ten rounds of `window` each and
    /// fails with [`ProxyError::StartupTimeout`] if no probe ever succeeded.
    pub async fn wait_for_startup(&self, window: Duration) -> Result<()> {
        for round in 1..=STARTUP_ROUNDS {
            let deadline = Instant::now() + window;
            loop {
                if self.has_started() {
                    return Ok(());
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(STARTUP_CHECK.min(deadline - now)).await;
            }
            debug!(round, "still waiting for a backend to answer its probe");
        }

        if self.has_started() {
            Ok(())
        } else {
            Err(ProxyError::StartupTimeout(window))
        }
    }
}

/// Filters `hosts` to those whose success rate exceeds `threshold` and
/// sorts them by ascending score.
pub fn rank(hosts: &[Arc<BackendHost>], threshold: f64) -> Vec<Arc<BackendHost>> {
    let mut active: Vec<(f64, Arc<BackendHost>)> = hosts
        .iter()
        .filter(|host| host.success_rate() > threshold)
        .map(|host| (host.average_latency(), Arc::clone(host)))
        .collect();
    active.sort_by(|a, b| a.0.total_cmp(&b.0));
    active.into_iter().map(|(_, host)| host).collect()
}

/// Sends one probe to `host`. Only a 2xx answer within `timeout` counts
/// as success.
pub async fn probe<C>(
    client: &Client<C, Full<Bytes>>,
    host: &BackendHost,
    timeout: Duration,
) -> ProbeOutcome
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let target = host.probe_url();
    let uri = match target.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(upstream = %host, probe = %target, error = %e, "failed to build probe URI");
            return ProbeOutcome::failed();
        }
    };

    let req = match Request::get(uri)
        .header(hyper::header::HOST, host.host())
        .body(Full::new(Bytes::new()))
    {
        Ok(req) => req,
        Err(e) => {
            warn!(upstream = %host, error = %e, "failed to build probe request");
            return ProbeOutcome::failed();
        }
    };

    let start = Instant::now();
    match tokio::time::timeout(timeout, client.request(req)).await {
        Ok(Ok(resp)) if resp.status().is_success() => {
            let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
            debug!(upstream = %host, status = resp.status().as_u16(), latency_ms, "probe succeeded");
            ProbeOutcome {
                success: true,
                latency_ms: Some(latency_ms),
            }
        }
        Ok(Ok(resp)) => {
            warn!(
                upstream = %host,
                status = resp.status().as_u16(),
                "probe returned non-success status"
            );
            ProbeOutcome::failed()
        }
        Ok(Err(e)) => {
            warn!(upstream = %host, error = %e, "probe request failed");
            ProbeOutcome::failed()
        }
        Err(_) => {
            warn!(upstream = %host, timeout = ?timeout, "probe timed out");
            ProbeOutcome::failed()
        }
    }
}
