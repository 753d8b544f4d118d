//! Configuration loading, validation, and runtime state.
//!
//! The proxy reads its settings exactly once at startup, either from the
//! process environment (`Port`, `PollInterval`, `Host1`, `Probe_path1`,
//! `IP1`, ...) or from a YAML file with the same settings. Both sources
//! produce a [`Config`], which [`Config::into_runtime`] validates and turns
//! into a [`RuntimeConfig`] holding durations and constructed
//! [`BackendHost`]s.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::upstream::BackendHost;
use crate::{ProxyError, Result};

/// Default port the proxy listens on.
pub const DEFAULT_PORT: u16 = 443;

/// Default interval between backend poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(15_000);

/// Default timeout for a single probe.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Default success rate, in percent, a backend must exceed to be active.
pub const DEFAULT_SUCCESS_RATE: u32 = 80;

/// Default timeout for a single proxied call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Default number of proxy workers.
pub const DEFAULT_WORKERS: usize = 10;

/// Default window for one round of waiting on the first successful probe.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

/// File that `IP hostname` pairs are appended to when requested.
pub const HOSTS_FILE: &str = "/etc/hosts";

/// Raw configuration as read from the environment or a YAML file.
///
/// Unset fields fall back to the `DEFAULT_*` constants in
/// [`Config::into_runtime`].
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Port to listen on (default 443).
    #[serde(default)]
    pub port: Option<u16>,
    /// Milliseconds between poll cycles (default 15000).
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Per-probe timeout in milliseconds (default 3000).
    #[serde(default)]
    pub poll_timeout_ms: Option<u64>,
    /// Success rate in percent a backend must exceed (default 80).
    #[serde(default)]
    pub success_rate: Option<u32>,
    /// Per-call timeout for proxied requests in milliseconds (default 3000).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Number of concurrent proxy workers (default 10).
    #[serde(default)]
    pub workers: Option<usize>,
    /// Bound on queued requests. Unset or zero means unbounded.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Seconds per round of waiting for the first successful probe (default 20).
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    /// Probe all hosts of a cycle concurrently instead of one by one.
    #[serde(default)]
    pub concurrent_probes: bool,
    /// Log every request in debug detail.
    #[serde(default)]
    pub debug: bool,
    /// File outcome events are appended to. Unset disables the event log.
    #[serde(default)]
    pub event_log_path: Option<String>,
    /// Append `IP hostname` lines to the hosts file at startup.
    #[serde(default)]
    pub append_hosts_file: bool,
    /// Backends, in configuration order.
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// Configuration for a single backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// The backend address (e.g. `"https://backend1:8443"`).
    pub host: String,
    /// Probe path and query; defaults to `echo/resource?param1=sample`.
    #[serde(default)]
    pub probe_path: Option<String>,
    /// Literal IP to connect to instead of resolving `host`.
    #[serde(default)]
    pub ip: Option<String>,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all tasks via `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Socket address the proxy binds to.
    pub listen: SocketAddr,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Success-rate threshold as a fraction in `[0, 1]`.
    pub success_threshold: f64,
    /// Per-call timeout shared by every proxied request.
    pub request_timeout: Duration,
    pub workers: usize,
    /// `None` means the intake queue is unbounded.
    pub queue_capacity: Option<usize>,
    pub startup_timeout: Duration,
    pub concurrent_probes: bool,
    pub debug: bool,
    pub event_log_path: Option<PathBuf>,
    pub append_hosts_file: bool,
    /// Backends that parsed successfully, in configuration order.
    pub hosts: Vec<Arc<BackendHost>>,
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))
    }

    /// Reads configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, which maps a variable name to
    /// its value.
    ///
    /// Hosts are read from `Host1`, `Host2`, ... until the first unset
    /// index, each with optional `Probe_pathN` and `IPN`. Values that fail
    /// to parse are logged and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let hosts = (1..)
            .map_while(|i| {
                value(&format!("Host{i}")).map(|host| HostConfig {
                    host,
                    probe_path: value(&format!("Probe_path{i}")),
                    ip: value(&format!("IP{i}")),
                })
            })
            .collect();

        Self {
            port: parse_or_default(&value, "Port"),
            poll_interval_ms: parse_or_default(&value, "PollInterval"),
            poll_timeout_ms: parse_or_default(&value, "PollTimeout"),
            success_rate: parse_or_default(&value, "SuccessRate"),
            timeout_ms: parse_or_default(&value, "Timeout"),
            workers: parse_or_default(&value, "Workers"),
            queue_capacity: parse_or_default(&value, "QueueCapacity"),
            startup_timeout_secs: parse_or_default(&value, "StartupTimeout"),
            concurrent_probes: flag(&value, "ConcurrentProbes"),
            debug: flag(&value, "Debug"),
            event_log_path: value("EventLogPath"),
            append_hosts_file: flag(&value, "AppendHostsFile") || flag(&value, "APPENDHOSTSFILE"),
            hosts,
        }
    }

    /// Validates all fields and constructs the backend list, producing a
    /// [`RuntimeConfig`].
    ///
    /// A host that fails to parse is logged and skipped; the remaining
    /// hosts are kept.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let success_rate = self.success_rate.unwrap_or(DEFAULT_SUCCESS_RATE);
        if success_rate > 100 {
            return Err(ProxyError::Config(format!(
                "success rate must be a percentage, got {success_rate}"
            )));
        }

        let workers = self.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(ProxyError::Config("at least one worker is required".into()));
        }

        let hosts = self
            .hosts
            .iter()
            .filter_map(|h| {
                match BackendHost::new(&h.host, h.probe_path.as_deref(), h.ip.as_deref()) {
                    Ok(host) => Some(Arc::new(host)),
                    Err(e) => {
                        warn!(host = %h.host, error = %e, "skipping backend");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        if hosts.is_empty() {
            warn!("no usable backends configured");
        }

        let port = self.port.unwrap_or(DEFAULT_PORT);

        Ok(RuntimeConfig {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            poll_interval: self
                .poll_interval_ms
                .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis),
            poll_timeout: self
                .poll_timeout_ms
                .map_or(DEFAULT_POLL_TIMEOUT, Duration::from_millis),
            success_threshold: f64::from(success_rate) / 100.0,
            request_timeout: self.timeout_ms.map_or(DEFAULT_TIMEOUT, Duration::from_millis),
            workers,
            queue_capacity: self.queue_capacity.filter(|c| *c > 0),
            startup_timeout: self
                .startup_timeout_secs
                .map_or(DEFAULT_STARTUP_TIMEOUT, Duration::from_secs),
            concurrent_probes: self.concurrent_probes,
            debug: self.debug,
            event_log_path: self.event_log_path.map(PathBuf::from),
            append_hosts_file: self.append_hosts_file,
            hosts,
        })
    }
}

impl RuntimeConfig {
    /// `IP hostname` lines for every backend with an IP override.
    pub fn hosts_file_entries(&self) -> Vec<String> {
        self.hosts
            .iter()
            .filter_map(|h| h.ip().map(|ip| format!("{ip} {}", h.host())))
            .collect()
    }

    /// Appends [`hosts_file_entries`](Self::hosts_file_entries) to the file
    /// at `path`. Does nothing when no backend has an IP override.
    pub fn append_hosts_entries(&self, path: &(impl AsRef<Path> + ?Sized)) -> Result<()> {
        let entries = self.hosts_file_entries();
        if entries.is_empty() {
            return Ok(());
        }

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        for entry in &entries {
            writeln!(file, "{entry}")?;
        }
        info!(
            path = %path.as_ref().display(),
            entries = entries.len(),
            "appended backend addresses to hosts file"
        );
        Ok(())
    }
}

fn parse_or_default<T>(value: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = value(name)?;
    match raw.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(setting = name, value = %raw, "unparseable setting, using default");
            None
        }
    }
}

fn flag(value: &impl Fn(&str) -> Option<String>, name: &str) -> bool {
    value(name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
