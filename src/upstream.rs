//! Per-backend identity and rolling health statistics.
//!
//! Each backend is a [`BackendHost`] holding its parsed address, probe
//! location and three bounded sample windows: probe latencies, probe
//! outcomes, and proxy round-trip latencies. Every window sits behind its
//! own lock so the poller can append while workers read derived metrics.
//! The error counter is a plain atomic.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use percent_encoding::percent_decode_str;
use url::Url;

use crate::ring::RingBuffer;
use crate::{ProxyError, Result};

/// Number of samples kept in each rolling window.
pub const SAMPLE_WINDOW: usize = 50;

/// Probe path used when a host is configured without one.
pub const DEFAULT_PROBE_PATH: &str = "echo/resource?param1=sample";

/// Penalty in milliseconds added to the mean latency at a 0% success rate.
const FAILURE_PENALTY_MS: f64 = 100.0;

/// Runtime state for a single backend.
#[derive(Debug)]
pub struct BackendHost {
    scheme: String,
    host: String,
    port: u16,
    ip: Option<IpAddr>,
    probe_path: String,
    url: String,
    latencies: Mutex<RingBuffer<f64>>,
    successes: Mutex<RingBuffer<bool>>,
    proxy_latencies: Mutex<RingBuffer<f64>>,
    errors: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackendHost {
    /// Parses a configured backend.
    ///
    /// `hostname` may omit the scheme, in which case `http` is assumed.
    /// The port defaults to the scheme's well-known port. A leading `/`
    /// on `probe_path` is dropped. `ip`, when given, must be a literal
    /// IPv4 or IPv6 address; connections to the host are then made to it
    /// through [`HostResolver`](crate::dns::HostResolver).
    pub fn new(hostname: &str, probe_path: Option<&str>, ip: Option<&str>) -> Result<Self> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(ProxyError::InvalidHost("hostname must not be empty".into()));
        }

        let with_scheme = if hostname.starts_with("http://") || hostname.starts_with("https://") {
            hostname.to_owned()
        } else {
            format!("http://{hostname}")
        };

        let parsed =
            Url::parse(&with_scheme).map_err(|e| ProxyError::InvalidHost(format!("{hostname}: {e}")))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidHost(format!("{hostname}: missing host")))?
            .to_owned();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ProxyError::InvalidHost(format!("{hostname}: missing port")))?;
        let scheme = parsed.scheme().to_owned();

        let ip = ip
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|e| ProxyError::InvalidAddress(format!("{s}: {e}")))
            })
            .transpose()?;

        let probe_path = probe_path
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PROBE_PATH)
            .trim_start_matches('/')
            .to_owned();

        let url = format!("{scheme}://{host}:{port}");

        Ok(Self {
            scheme,
            host,
            port,
            ip,
            probe_path,
            url,
            latencies: Mutex::new(RingBuffer::new(SAMPLE_WINDOW)),
            successes: Mutex::new(RingBuffer::new(SAMPLE_WINDOW)),
            proxy_latencies: Mutex::new(RingBuffer::new(SAMPLE_WINDOW)),
            errors: AtomicU64::new(0),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The configured hostname, also sent as the outbound `Host` header.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The literal IP override, if any.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn probe_path(&self) -> &str {
        &self.probe_path
    }

    /// `scheme://host:port`, the backend's identity.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Percent-decoded probe URL.
    pub fn probe_url(&self) -> String {
        decode(&format!("{}/{}", self.url, self.probe_path))
    }

    /// Records the wall-clock duration of a completed probe.
    pub fn add_latency(&self, ms: f64) {
        lock(&self.latencies).push(ms);
    }

    /// Records the outcome of a probe.
    pub fn add_success(&self, success: bool) {
        lock(&self.successes).push(success);
    }

    /// Records the backend round-trip time of a delivered proxy attempt.
    pub fn add_proxy_latency(&self, ms: f64) {
        lock(&self.proxy_latencies).push(ms);
    }

    /// Counts a failed proxy attempt. Has no effect on ranking.
    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Fraction of successful probes in the window, `0.0` when empty.
    pub fn success_rate(&self) -> f64 {
        lock(&self.successes).true_ratio()
    }

    /// Mean probe latency plus a penalty of up to 100 ms scaled by the
    /// failure rate. `0.0` when no latency has been recorded.
    pub fn average_latency(&self) -> f64 {
        let mean = {
            let latencies = lock(&self.latencies);
            if latencies.is_empty() {
                return 0.0;
            }
            latencies.mean()
        };
        mean + (1.0 - self.success_rate()) * FAILURE_PENALTY_MS
    }

    /// Mean proxy round-trip latency, `0.0` when empty.
    pub fn proxy_latency(&self) -> f64 {
        lock(&self.proxy_latencies).mean()
    }

    /// Snapshot of the latency window, oldest first.
    pub fn latency_samples(&self) -> Vec<f64> {
        lock(&self.latencies).iter().copied().collect()
    }

    /// Snapshot of the outcome window, oldest first.
    pub fn success_samples(&self) -> Vec<bool> {
        lock(&self.successes).iter().copied().collect()
    }

    pub fn proxy_latency_samples(&self) -> Vec<f64> {
        lock(&self.proxy_latencies).iter().copied().collect()
    }
}

impl fmt::Display for BackendHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
