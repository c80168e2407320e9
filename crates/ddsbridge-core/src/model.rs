//! Value types shared by the clients, the cache and the orchestrators.
//!
//! Serialized field names are camelCase so the types can be handed to a
//! JSON resource layer unchanged.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque caller session identifier (an HTTP session id, a CLI run id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Worker application id.
pub type AppId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpacecraftSelection {
    #[default]
    East,
    West,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParitySelection {
    #[default]
    Good,
    Bad,
}

/// Filter and time window for one retrieval.
///
/// `since`/`until` are passed to the archive verbatim ("now - 12 hours",
/// "2024/001 00:00:00", ...); they are not parsed here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchCriteria {
    pub since: Option<String>,
    pub until: Option<String>,
    pub settling_time_delay: bool,
    pub platform_ids: Vec<String>,
    pub platform_names: Vec<String>,
    pub netlist_names: Vec<String>,
    pub goes_channels: Vec<u32>,
    pub goes_self_timed: bool,
    pub goes_random: bool,
    #[serde(rename = "networkDCP")]
    pub network_dcp: bool,
    pub iridium: bool,
    pub quality_notifications: bool,
    pub goes_spacecraft_check: bool,
    pub goes_spacecraft_selection: SpacecraftSelection,
    pub parity_check: bool,
    pub parity_selection: ParitySelection,
}

impl SearchCriteria {
    /// Criteria for the most recent messages of one platform/transport id.
    pub fn for_platform(id: impl Into<String>, since: impl Into<String>) -> Self {
        Self {
            since: Some(since.into()),
            until: Some("now".to_string()),
            platform_ids: vec![id.into()],
            ..Self::default()
        }
    }
}

/// One raw store-and-forward message as delivered by the archive.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMessage {
    pub flags: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_num: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_recv_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier_stop: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baud: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub good_phase_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_offset: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_noise: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xmit_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub momsn: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtmsn: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdr_reference: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_status: Option<i32>,
    /// Message bytes, base64 encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
}

/// One page of a retrieval.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessageBlock {
    pub messages: Vec<RawMessage>,
    pub more_to_follow: bool,
}

impl RawMessageBlock {
    /// A final block carrying whatever messages arrived with it.
    #[must_use]
    pub fn last(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            more_to_follow: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkListItem {
    pub transport_id: String,
    pub platform_name: Option<String>,
    pub description: Option<String>,
}

/// A named set of transport ids used as a retrieval filter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkList {
    pub name: String,
    pub transport_medium_type: Option<String>,
    pub items: Vec<NetworkListItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownlinkStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: Option<String>,
}

/// Snapshot of archive health, fetched one-shot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveStatus {
    pub hostname: Option<String>,
    pub system_status: Option<String>,
    pub is_usable: Option<bool>,
    pub system_time: Option<DateTime<Utc>>,
    pub max_clients: Option<u32>,
    pub current_num_clients: Option<u32>,
    pub lrgs_version: Option<String>,
    pub arc_last_seq_num: Option<i64>,
    pub downlinks: Vec<DownlinkStatus>,
}

/// Event priority as written by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventPriority {
    Debug3,
    Debug2,
    Debug1,
    Info,
    Warning,
    Failure,
    Fatal,
}

impl EventPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug3 => "DEBUG3",
            Self::Debug2 => "DEBUG2",
            Self::Debug1 => "DEBUG1",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Failure => "FAILURE",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG3" => Ok(Self::Debug3),
            "DEBUG2" => Ok(Self::Debug2),
            "DEBUG1" => Ok(Self::Debug1),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "FAILURE" => Ok(Self::Failure),
            "FATAL" => Ok(Self::Fatal),
            other => Err(format!("unknown event priority: {other}")),
        }
    }
}

/// One log/event record read from a worker's event port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEvent {
    pub app_id: AppId,
    pub app_name: String,
    pub priority: Option<EventPriority>,
    pub event_time: Option<DateTime<Utc>>,
    pub event_text: String,
}

/// Live status record of a worker, as kept by the worker registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub app_id: AppId,
    pub app_name: String,
    pub hostname: Option<String>,
    pub pid: Option<u32>,
    pub event_port: Option<u16>,
    pub heartbeat: Option<DateTime<Utc>>,
}

/// Outcome of checking a worker status record against the liveness threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// No pid or no heartbeat recorded.
    NotRunning,
    StaleHeartbeat,
}

impl WorkerStatus {
    #[must_use]
    pub fn liveness(&self, now: DateTime<Utc>, threshold: Duration) -> Liveness {
        let Some(heartbeat) = self.heartbeat else {
            return Liveness::NotRunning;
        };
        if self.pid.is_none() {
            return Liveness::NotRunning;
        }
        let age = now.signed_duration_since(heartbeat);
        match age.to_std() {
            Ok(age) if age > threshold => Liveness::StaleHeartbeat,
            _ => Liveness::Running,
        }
    }

    /// Host to connect to for the event port.
    #[must_use]
    pub fn event_host(&self) -> &str {
        self.hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost")
    }
}
