//! External collaborators: archive endpoints, netlist definitions and the
//! worker registry.
//!
//! The orchestrators only see the traits. The config-backed and in-memory
//! implementations here serve the CLI and the tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::config::{Config, DEFAULT_DDS_PORT, SourceConfig};
use crate::model::{AppId, NetworkList, WorkerStatus};

/// Username sent in a plain hello when the source configures none.
pub const DEFAULT_USERNAME: &str = "anonymous";

/// Failure inside a collaborator (database down, bad definition, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LookupError(pub String);

/// Where and as whom to reach an archive.
#[derive(Clone, PartialEq, Eq)]
pub struct ArchiveEndpoint {
    /// Configured source name, used in error messages.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for ArchiveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveEndpoint")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .finish()
    }
}

impl ArchiveEndpoint {
    fn from_source(source: &SourceConfig) -> Self {
        let host = source
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(&source.name)
            .to_string();
        let port = source
            .port
            .as_ref()
            .map_or(DEFAULT_DDS_PORT, |port| port.resolve());
        Self {
            name: source.name.clone(),
            host,
            port,
            username: source
                .username
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
            password: source.password.clone(),
        }
    }
}

/// Resolves a named (or the default) archive source.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// `Ok(None)` means nothing usable is configured.
    async fn resolve_archive_endpoint(
        &self,
        name: Option<&str>,
    ) -> Result<Option<ArchiveEndpoint>, LookupError>;
}

/// Resolves network list names to their current definition.
#[async_trait]
pub trait NetlistStore: Send + Sync {
    async fn resolve_network_list(&self, name: &str) -> Result<Option<NetworkList>, LookupError>;
}

/// Live status records of worker processes.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn worker_status(&self, app_id: AppId) -> Result<Option<WorkerStatus>, LookupError>;
}

/// Archive sources from `[[sources]]` and `gateway.default_source`.
#[derive(Debug, Clone, Default)]
pub struct ConfigEndpointSource {
    sources: Vec<SourceConfig>,
    default_source: Option<String>,
}

impl ConfigEndpointSource {
    pub fn new(sources: Vec<SourceConfig>, default_source: Option<String>) -> Self {
        Self {
            sources,
            default_source,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sources.clone(), config.gateway.default_source.clone())
    }

    fn find(&self, name: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Named source, else the default source, else the first lrgs source.
    pub fn resolve(&self, name: Option<&str>) -> Option<ArchiveEndpoint> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let source = match name {
            Some(name) => self.find(name),
            None => self
                .default_source
                .as_deref()
                .and_then(|d| self.find(d))
                .or_else(|| self.sources.iter().find(|s| s.is_lrgs())),
        }?;
        Some(ArchiveEndpoint::from_source(source))
    }
}

#[async_trait]
impl EndpointSource for ConfigEndpointSource {
    async fn resolve_archive_endpoint(
        &self,
        name: Option<&str>,
    ) -> Result<Option<ArchiveEndpoint>, LookupError> {
        Ok(self.resolve(name))
    }
}

/// Netlists held in memory, keyed case-insensitively by name.
#[derive(Debug, Default)]
pub struct StaticNetlistStore {
    lists: HashMap<String, NetworkList>,
}

impl StaticNetlistStore {
    pub fn new(lists: impl IntoIterator<Item = NetworkList>) -> Self {
        Self {
            lists: lists
                .into_iter()
                .map(|list| (list.name.to_lowercase(), list))
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.netlists.iter().map(NetworkList::from))
    }
}

#[async_trait]
impl NetlistStore for StaticNetlistStore {
    async fn resolve_network_list(&self, name: &str) -> Result<Option<NetworkList>, LookupError> {
        Ok(self.lists.get(&name.to_lowercase()).cloned())
    }
}

/// Worker status records kept in memory; updated by whoever tracks workers.
#[derive(Debug, Default)]
pub struct StaticWorkerRegistry {
    workers: RwLock<HashMap<AppId, WorkerStatus>>,
}

impl StaticWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `status.app_id`.
    pub fn upsert(&self, status: WorkerStatus) {
        self.workers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(status.app_id, status);
    }

    pub fn remove(&self, app_id: AppId) -> Option<WorkerStatus> {
        self.workers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&app_id)
    }
}

#[async_trait]
impl WorkerRegistry for StaticWorkerRegistry {
    async fn worker_status(&self, app_id: AppId) -> Result<Option<WorkerStatus>, LookupError> {
        Ok(self
            .workers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&app_id)
            .cloned())
    }
}
