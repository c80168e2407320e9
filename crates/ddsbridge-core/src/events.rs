//! Worker event-port client.
//!
//! A running worker exposes a TCP port that streams its log records as
//! newline-terminated lines:
//!
//! ```text
//! INFO 2024/03/01-12:00:05 Processing 42 messages
//! ```
//!
//! [`EventStreamClient`] attaches to that port and returns whatever arrived
//! since the previous poll. The pid the client was opened against is kept
//! so the caller can detect a worker restart.

use std::fmt;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeZone, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

use crate::config::GatewayConfig;
use crate::model::{AppEvent, AppId, EventPriority};

/// Longest line kept; the remainder of a longer line is dropped.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const EVENT_TIME_FORMAT: &str = "%Y/%m/%d-%H:%M:%S";
const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("cannot connect to event port {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to event port {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },
    #[error("event port closed by peer")]
    Disconnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EventError {
    #[must_use]
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }
}

#[derive(Debug, Clone)]
pub struct EventClientConfig {
    pub connect_timeout: Duration,
    /// A poll returns after this long without new bytes.
    pub poll_window: Duration,
    /// Upper bound on one poll against a chatty worker.
    pub max_poll: Duration,
}

impl EventClientConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            poll_window: config.event_poll_window(),
            ..Self::default()
        }
    }
}

impl Default for EventClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            poll_window: Duration::from_millis(250),
            max_poll: Duration::from_secs(2),
        }
    }
}

/// Splits a byte stream into lines, truncating overlong ones.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
    skipping: bool,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        for &b in bytes {
            if b == b'\n' {
                if !self.skipping {
                    out.push(take_line(&mut self.pending));
                }
                self.pending.clear();
                self.skipping = false;
                continue;
            }
            if self.skipping {
                continue;
            }
            self.pending.push(b);
            if self.pending.len() >= MAX_LINE_BYTES {
                out.push(take_line(&mut self.pending));
                self.skipping = true;
            }
        }
    }

    /// Emit an unterminated trailing line, if any.
    fn finish(&mut self, out: &mut Vec<String>) {
        if !self.skipping && !self.pending.is_empty() {
            out.push(take_line(&mut self.pending));
        }
        self.pending.clear();
        self.skipping = false;
    }
}

fn take_line(pending: &mut Vec<u8>) -> String {
    let bytes = std::mem::take(pending);
    let text = String::from_utf8_lossy(&bytes);
    text.trim_end_matches('\r').to_string()
}

/// Parse one event line; `None` for blank lines.
///
/// Lines not in `PRIORITY TIME text` form come back with no priority or
/// time and the whole line as text.
pub fn parse_event_line(app_id: AppId, app_name: &str, line: &str) -> Option<AppEvent> {
    if line.trim().is_empty() {
        return None;
    }
    let structured = line.split_once(' ').and_then(|(priority, rest)| {
        let priority = priority.parse::<EventPriority>().ok()?;
        let rest = rest.trim_start();
        let (stamp, text) = rest.split_once(' ').unwrap_or((rest, ""));
        let naive = NaiveDateTime::parse_from_str(stamp, EVENT_TIME_FORMAT).ok()?;
        Some((priority, Utc.from_utc_datetime(&naive), text.trim_start()))
    });

    let (priority, event_time, event_text) = match structured {
        Some((priority, time, text)) => (Some(priority), Some(time), text.to_string()),
        None => (None, None, line.to_string()),
    };
    Some(AppEvent {
        app_id,
        app_name: app_name.to_string(),
        priority,
        event_time,
        event_text,
    })
}

/// One connection to a worker's event port.
pub struct EventStreamClient {
    app_id: AppId,
    app_name: String,
    host: String,
    port: u16,
    pid: u32,
    stream: TcpStream,
    lines: LineBuffer,
    peer_closed: bool,
    config: EventClientConfig,
}

impl fmt::Debug for EventStreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStreamClient")
            .field("app_id", &self.app_id)
            .field("app_name", &self.app_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("peer_closed", &self.peer_closed)
            .finish_non_exhaustive()
    }
}

impl EventStreamClient {
    pub async fn connect(
        app_id: AppId,
        host: &str,
        port: u16,
        app_name: &str,
        pid: u32,
        config: EventClientConfig,
    ) -> Result<Self, EventError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| EventError::ConnectTimeout {
                host: host.to_string(),
                port,
            })?
            .map_err(|source| EventError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;
        tracing::debug!(app_id, host, port, pid, "Connected to worker event port");

        Ok(Self {
            app_id,
            app_name: app_name.to_string(),
            host: host.to_string(),
            port,
            pid,
            stream,
            lines: LineBuffer::default(),
            peer_closed: false,
            config,
        })
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Pid of the worker process this client was opened against.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Drain events that arrived since the last poll.
    ///
    /// Returns after one quiet poll window. A peer close before any new data
    /// is an error; a close after data returns that data and fails the next
    /// poll.
    pub async fn poll_new_events(&mut self) -> Result<Vec<AppEvent>, EventError> {
        if self.peer_closed {
            return Err(EventError::Disconnected);
        }

        let deadline = Instant::now() + self.config.max_poll;
        let mut raw_lines = Vec::new();
        let mut received = false;
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let read = match timeout(self.config.poll_window, self.stream.read(&mut chunk)).await {
                Err(_) => break,
                Ok(result) => result,
            };
            match read {
                Ok(0) => {
                    self.peer_closed = true;
                    self.lines.finish(&mut raw_lines);
                    if received {
                        break;
                    }
                    tracing::debug!(app_id = self.app_id, pid = self.pid, "Event port closed");
                    return Err(EventError::Disconnected);
                }
                Ok(n) => {
                    received = true;
                    self.lines.push(&chunk[..n], &mut raw_lines);
                }
                Err(err) => {
                    self.peer_closed = true;
                    return Err(err.into());
                }
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        let events: Vec<AppEvent> = raw_lines
            .iter()
            .filter_map(|line| parse_event_line(self.app_id, &self.app_name, line))
            .collect();
        if !events.is_empty() {
            tracing::debug!(app_id = self.app_id, events = events.len(), "Polled worker events");
        }
        Ok(events)
    }

    pub async fn close(&mut self) -> Result<(), EventError> {
        self.peer_closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }
}
