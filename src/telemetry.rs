//! Outcome reporting: telemetry hooks and the JSON event log.
//!
//! [`Telemetry`] mirrors an exception/event/request tracking client;
//! [`TracingTelemetry`] is the default and records everything through
//! `tracing`. [`EventSink`] receives one JSON line per proxied request or
//! failed attempt; [`EventLog`] is a buffered sink that appends batches to
//! a file from a background task.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use hyper::StatusCode;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;

/// Maximum number of lines written per batch.
const BATCH_SIZE: usize = 100;

/// Interval between event log flushes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Tracking client for exceptions, named events and completed requests.
pub trait Telemetry: Send + Sync {
    fn track_exception(&self, error: &dyn std::error::Error);

    fn track_event(&self, name: &str, properties: &[(&str, String)]);

    fn track_request(
        &self,
        name: &str,
        started: SystemTime,
        duration: Duration,
        status: StatusCode,
        success: bool,
    );
}

/// [`Telemetry`] that records through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn track_exception(&self, error: &dyn std::error::Error) {
        error!(target: "telemetry", error = %error, "exception");
    }

    fn track_event(&self, name: &str, properties: &[(&str, String)]) {
        info!(target: "telemetry", event = name, properties = ?properties, "event");
    }

    fn track_request(
        &self,
        name: &str,
        started: SystemTime,
        duration: Duration,
        status: StatusCode,
        success: bool,
    ) {
        debug!(
            target: "telemetry",
            request = name,
            started = %iso8601(started),
            duration_ms = duration.as_millis() as u64,
            status = status.as_u16(),
            success,
            "request"
        );
    }
}

/// Receiver of line-oriented outcome events.
pub trait EventSink: Send + Sync {
    fn send(&self, line: String);
}

/// One outcome event, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EventRecord {
    Completed {
        #[serde(rename = "Date")]
        date: String,
        #[serde(rename = "Url")]
        url: String,
        #[serde(rename = "Status")]
        status: String,
        #[serde(rename = "Latency")]
        latency: String,
    },
    Failed {
        #[serde(rename = "Date")]
        date: String,
        #[serde(rename = "Url")]
        url: String,
        #[serde(rename = "Error")]
        error: String,
    },
}

impl EventRecord {
    /// A delivered response. `latency` is rendered as `ss:fff`.
    pub fn completed(
        url: &str,
        status: StatusCode,
        requested: SystemTime,
        responded: SystemTime,
    ) -> Self {
        let latency = responded.duration_since(requested).unwrap_or_default();
        Self::Completed {
            date: iso8601(responded),
            url: url.to_owned(),
            status: status.to_string(),
            latency: format_latency(latency),
        }
    }

    /// A failed attempt or request.
    pub fn failed(url: &str, requested: SystemTime, error: impl Into<String>) -> Self {
        Self::Failed {
            date: iso8601(requested),
            url: url.to_owned(),
            error: error.into(),
        }
    }

    pub fn to_line(&self) -> String {
        // Only string fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Renders a duration as `ss:fff` (seconds wrap at one minute).
pub fn format_latency(latency: Duration) -> String {
    format!(
        "{:02}:{:03}",
        latency.as_secs() % 60,
        latency.subsec_millis()
    )
}

/// ISO-8601 timestamp with microsecond precision.
pub fn iso8601(at: SystemTime) -> String {
    DateTime::<Utc>::from(at).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Buffered [`EventSink`] that appends batches of lines to a file.
///
/// [`send`](EventSink::send) only pushes onto an in-memory buffer; the
/// task started by [`spawn`](Self::spawn) swaps the buffer out once a
/// second and writes it in batches of at most 100 lines. Whatever is left
/// is written when the shutdown signal fires.
#[derive(Debug, Clone)]
pub struct EventLog {
    buffer: Arc<Mutex<Vec<String>>>,
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            path: path.into(),
        }
    }

    /// Number of lines waiting to be written.
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Writes all buffered lines to the file.
    ///
    /// Lines that could not be written are put back at the front of the
    /// buffer and retried on the next flush.
    pub async fn flush(&self) -> std::io::Result<usize> {
        let lines = self.take();
        if lines.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        match self.append(&lines, &mut written).await {
            Ok(()) => Ok(lines.len()),
            Err(e) => {
                self.restore(lines.into_iter().skip(written).collect());
                Err(e)
            }
        }
    }

    async fn append(&self, lines: &[String], written: &mut usize) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        for batch in lines.chunks(BATCH_SIZE) {
            let mut chunk = batch.join("\n");
            chunk.push('\n');
            file.write_all(chunk.as_bytes()).await?;
            *written += batch.len();
        }
        file.flush().await
    }

    fn restore(&self, mut unwritten: Vec<String>) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        unwritten.append(&mut buffer);
        *buffer = unwritten;
    }

    /// Spawns the periodic flusher.
    pub fn spawn(&self, shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = log.flush().await {
                            warn!(path = %log.path.display(), error = %e, "failed to write event log");
                        }
                    }
                    () = shutdown.cancelled() => {
                        if let Err(e) = log.flush().await {
                            warn!(path = %log.path.display(), error = %e, "failed to write event log");
                        }
                        break;
                    }
                }
            }
        })
    }
}

impl EventSink for EventLog {
    fn send(&self, line: String) {
        let line = line.trim_start_matches('\n').to_owned();
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}
