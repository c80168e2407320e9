//! Configuration for the bridge (ddsbridge.toml).
//!
//! Every section is `#[serde(default)]`, so an empty file is a valid config
//! with no archive sources. Passwords are redacted from `Debug` output and
//! from [`Config::to_redacted_toml`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::model::{NetworkList, NetworkListItem};

/// Default DDS port of an LRGS archive.
pub const DEFAULT_DDS_PORT: u16 = 16003;

/// Environment variable naming an explicit config path.
pub const CONFIG_ENV_VAR: &str = "DDSBRIDGE_CONFIG";

const REDACTED: &str = "********";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly colored output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LogConfig,
    pub gateway: GatewayConfig,
    pub sources: Vec<SourceConfig>,
    pub netlists: Vec<NetlistConfig>,
}

/// Timeouts and policy knobs for the orchestrators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Source used when a request does not name one.
    pub default_source: Option<String>,
    /// Seconds a single block pull may wait for new data.
    pub pull_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    /// Read/write timeout for handshake, netlist and criteria exchanges.
    pub io_timeout_ms: u64,
    /// Retrieval clients idle longer than this are closed by the reaper.
    pub idle_client_secs: u64,
    /// Heartbeats older than this mean the worker is not running.
    pub worker_liveness_secs: u64,
    pub reap_interval_secs: u64,
    /// Quiet interval that ends one event poll.
    pub event_poll_window_ms: u64,
    /// `since` expression used by single-message lookups.
    pub single_message_lookback: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_source: None,
            pull_timeout_secs: 60,
            connect_timeout_ms: 10_000,
            io_timeout_ms: 30_000,
            idle_client_secs: 90,
            worker_liveness_secs: 20,
            reap_interval_secs: 30,
            event_poll_window_ms: 250,
            single_message_lookback: "now - 12 hours".to_string(),
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    #[must_use]
    pub fn idle_client_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_client_secs)
    }

    #[must_use]
    pub fn worker_liveness(&self) -> Duration {
        Duration::from_secs(self.worker_liveness_secs)
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    #[must_use]
    pub fn event_poll_window(&self) -> Duration {
        Duration::from_millis(self.event_poll_window_ms)
    }
}

/// Port as written in config: a number, or a string carried over from
/// property-style source definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSetting {
    Number(i64),
    Text(String),
}

impl PortSetting {
    /// Resolve to a usable port; anything unparsable or out of range falls
    /// back to [`DEFAULT_DDS_PORT`].
    #[must_use]
    pub fn resolve(&self) -> u16 {
        let parsed = match self {
            Self::Number(n) => u16::try_from(*n).ok(),
            Self::Text(s) => s.trim().parse::<u16>().ok(),
        };
        match parsed {
            Some(0) | None => DEFAULT_DDS_PORT,
            Some(port) => port,
        }
    }
}

/// A named archive data source.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    /// Source type; only `lrgs` sources are eligible as the implicit default.
    pub kind: String,
    /// Falls back to `name` when unset.
    pub host: Option<String>,
    pub port: Option<PortSetting>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "lrgs".to_string(),
            host: None,
            port: None,
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .finish()
    }
}

impl SourceConfig {
    #[must_use]
    pub fn is_lrgs(&self) -> bool {
        self.kind.eq_ignore_ascii_case("lrgs")
    }
}

/// A network list definition stored alongside the config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetlistConfig {
    pub name: String,
    pub transport_medium_type: Option<String>,
    pub items: Vec<NetlistItemConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetlistItemConfig {
    pub transport_id: String,
    pub platform_name: Option<String>,
    pub description: Option<String>,
}

impl From<&NetlistConfig> for NetworkList {
    fn from(cfg: &NetlistConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            transport_medium_type: cfg.transport_medium_type.clone(),
            items: cfg
                .items
                .iter()
                .map(|item| NetworkListItem {
                    transport_id: item.transport_id.clone(),
                    platform_name: item.platform_name.clone(),
                    description: item.description.clone(),
                })
                .collect(),
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(
            path = %path.display(),
            sources = config.sources.len(),
            netlists = config.netlists.len(),
            "Loaded config"
        );
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let gw = &self.gateway;
        for (name, value) in [
            ("gateway.pull_timeout_secs", gw.pull_timeout_secs),
            ("gateway.connect_timeout_ms", gw.connect_timeout_ms),
            ("gateway.io_timeout_ms", gw.io_timeout_ms),
            ("gateway.idle_client_secs", gw.idle_client_secs),
            ("gateway.worker_liveness_secs", gw.worker_liveness_secs),
            ("gateway.reap_interval_secs", gw.reap_interval_secs),
            ("gateway.event_poll_window_ms", gw.event_poll_window_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "sources[].name must not be empty".to_string(),
                ));
            }
            if !seen.insert(source.name.to_lowercase()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate source name: {}",
                    source.name
                )));
            }
        }

        for netlist in &self.netlists {
            if netlist.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "netlists[].name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Serialize with every password replaced by a placeholder.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut copy = self.clone();
        for source in &mut copy.sources {
            if source.password.is_some() {
                source.password = Some(REDACTED.to_string());
            }
        }
        toml::to_string_pretty(&copy).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }
}

/// Resolve which config file to use.
///
/// Order: explicit path, `DDSBRIDGE_CONFIG`, then
/// `<config dir>/ddsbridge/ddsbridge.toml` if it exists.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let candidate = dirs::config_dir()?.join("ddsbridge").join("ddsbridge.toml");
    candidate.exists().then_some(candidate)
}
