//! Error types for ddsbridge-core

use thiserror::Error;

/// A command the operator can run while fixing an error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    pub label: String,
    pub command: String,
}

/// Operator-facing hint attached to an error: one summary line, optional
/// commands, optional fallbacks.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    pub summary: String,
    pub commands: Vec<RemediationCommand>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        let (label, command) = (label.into(), command.into());
        self.commands.push(RemediationCommand { label, command });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Indented plain-text block printed under the error line.
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut lines = vec!["To fix:".to_string(), format!("  {}", self.summary)];
        if !self.commands.is_empty() {
            lines.push("  Commands:".to_string());
            lines.extend(
                self.commands
                    .iter()
                    .map(|c| format!("    - {}: {}", c.label, c.command)),
            );
        }
        if !self.alternatives.is_empty() {
            lines.push("  Alternatives:".to_string());
            lines.extend(self.alternatives.iter().map(|a| format!("    - {a}")));
        }
        let mut output = lines.join("\n");
        output.push('\n');
        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ddsbridge-core
#[derive(Error, Debug)]
pub enum Error {
    /// Caller-visible retrieval / event-stream outcomes
    #[error("{0}")]
    Gateway(#[from] GatewayError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialisation errors
    #[error("Logging error: {0}")]
    Log(#[from] crate::logging::LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Gateway(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Log(_) => None,
            Self::Io(_) => Some(
                Remediation::new("A local file could not be read or written.")
                    .alternative("Make sure the log file directory is writable by this user."),
            ),
            Self::Json(_) => Some(Remediation::new(
                "A payload could not be encoded as JSON; rerun with --log-level debug for details.",
            )),
        }
    }
}

/// Coarse, serializable classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorKind {
    MissingPrerequisite,
    NotFound,
    BadConfig,
    Protocol,
    SocketClosed,
    Conflict,
}

/// The small, stable set of failures a caller of the gateway can observe.
///
/// None of these are retried internally; every one of them leaves the
/// session without a cached client for the failed kind, so the caller may
/// resubmit criteria (or simply poll again) to start over.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The caller skipped a required earlier step (e.g. no criteria submitted).
    #[error("{0}")]
    MissingPrerequisite(String),

    /// Nothing to return: no stored criteria, no matching message, worker not running.
    #[error("{0}")]
    NotFound(String),

    /// The archive endpoint could not be resolved or reached.
    #[error("Cannot connect to archive source {source_name}: {detail}")]
    BadConfig { source_name: String, detail: String },

    /// The peer rejected or garbled an exchange.
    #[error("Error while {phase}: {detail}")]
    Protocol { phase: String, detail: String },

    /// The transport was severed mid-exchange.
    #[error("IO error on archive source {source_name}: {detail}")]
    SocketClosed { source_name: String, detail: String },

    /// Cannot safely proceed (e.g. worker event port unreachable).
    #[error("{0}")]
    Conflict(String),
}

impl GatewayError {
    #[must_use]
    pub fn kind(&self) -> GatewayErrorKind {
        match self {
            Self::MissingPrerequisite(_) => GatewayErrorKind::MissingPrerequisite,
            Self::NotFound(_) => GatewayErrorKind::NotFound,
            Self::BadConfig { .. } => GatewayErrorKind::BadConfig,
            Self::Protocol { .. } => GatewayErrorKind::Protocol,
            Self::SocketClosed { .. } => GatewayErrorKind::SocketClosed,
            Self::Conflict(_) => GatewayErrorKind::Conflict,
        }
    }

    /// HTTP-style status code for the resource layer.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingPrerequisite(_) => 400,
            Self::NotFound(_) => 404,
            Self::BadConfig { .. } | Self::SocketClosed { .. } => 412,
            Self::Protocol { .. } | Self::Conflict(_) => 409,
        }
    }

    /// Structured body suitable for a JSON error response.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            status: self.status_code(),
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MissingPrerequisite(_) => {
                Remediation::new("Submit search criteria for this session before pulling messages.")
                    .command("Submit and page", "ddsb fetch --since 'now - 1 hour'")
            }
            Self::NotFound(_) => Remediation::new("Nothing matched. Widen the time window or check the id.")
                .alternative("For workers, confirm the process is running and updating its heartbeat."),
            Self::BadConfig { source_name, .. } => Remediation::new(format!(
                "Check host/port/credentials of archive source '{source_name}'."
            ))
            .command("Show effective config", "ddsb config")
            .alternative("Set gateway.default_source to a reachable lrgs source."),
            Self::Protocol { .. } => Remediation::new(
                "The archive rejected the request. Resubmit criteria to start a fresh retrieval.",
            )
            .command("Check archive status", "ddsb status"),
            Self::SocketClosed { .. } => Remediation::new(
                "The archive closed the connection. Resubmit criteria and retry.",
            )
            .command("Check archive status", "ddsb status"),
            Self::Conflict(_) => Remediation::new(
                "The worker's event port is unreachable. Retry after the worker settles.",
            )
            .alternative("If the worker was restarted, the next poll reconnects automatically."),
        }
    }
}

/// JSON body for a [`GatewayError`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub status: u16,
    pub kind: GatewayErrorKind,
    pub message: String,
}

/// Problems loading or checking `ddsbridge.toml`
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("cannot read {0}: {1}")]
    ReadFailed(String, String),

    #[error("invalid TOML: {0}")]
    ParseFailed(String),

    #[error("cannot render config as TOML: {0}")]
    SerializeFailed(String),

    #[error("invalid setting: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!("Nothing exists at {path}."))
                .alternative("Point --config (or $DDSBRIDGE_CONFIG) at an existing ddsbridge.toml.")
                .alternative("Omit both to run with built-in defaults."),
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("{path} exists but could not be opened."))
                    .command("Inspect ownership", format!("stat '{path}'"))
            }
            Self::ParseFailed(_) => Remediation::new("Correct the TOML and rerun.")
                .alternative("README.md has a complete sample configuration."),
            Self::SerializeFailed(_) => Remediation::new("Report this; a loaded config should always render."),
            Self::ValidationError(_) => Remediation::new("Change the named setting and rerun.")
                .command("Show effective config", "ddsb config"),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    match error.remediation() {
        Some(remediation) => format!("Error: {error}\n\n{}", remediation.render_plain()),
        None => format!("Error: {error}"),
    }
}
