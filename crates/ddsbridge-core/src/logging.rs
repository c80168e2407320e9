//! Structured logging for ddsbridge
//!
//! Logging goes through `tracing`. Two output formats are supported:
//!
//! - **Pretty**: colored human output on stderr
//! - **JSON**: one JSON object per line, for log shippers
//!
//! An optional log file receives the same events, uncolored, in the same
//! format.
//!
//! # Correlation Fields
//!
//! Spans and events use these names consistently:
//! - `session`: caller session key
//! - `source`: archive source name
//! - `app_id`: worker application id
//! - `phase`: retrieval phase ("connecting", "sending searchcrit", ...)
//!
//! Passwords and authenticators are never logged.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::{EnvFilter, Layer, fmt};

static INSTALLED: AtomicBool = AtomicBool::new(false);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Logging configuration (`[logging]` in ddsbridge.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter; `RUST_LOG` takes precedence when set
    pub level: String,

    pub format: LogFormat,

    /// Optional log file, appended to
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level {0:?} (expected trace, debug, info, warn, error or off)")]
    InvalidLevel(String),

    #[error("cannot open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("cannot install subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Open `path` for appending; new directories get 0700, a new file 0600.
fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path)
}

/// `RUST_LOG` when set, otherwise the configured level.
fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = level.trim();
    let parsed: LevelFilter = level
        .parse()
        .map_err(|_| LogError::InvalidLevel(level.to_string()))?;
    Ok(EnvFilter::default().add_directive(parsed.into()))
}

/// One output layer in `format` writing to `writer`.
fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// Call once at startup; later calls return [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.load(Ordering::Acquire) {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = build_filter(&config.level)?;
    let mut layers = vec![format_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = open_log_file(path)?;
        layers.push(format_layer(config.format, file, false));
    }

    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers).with(filter))?;
    INSTALLED.store(true, Ordering::Release);

    tracing::debug!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging ready"
    );
    Ok(())
}
