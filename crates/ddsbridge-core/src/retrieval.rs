//! Paged message retrieval per session.
//!
//! Criteria are stored per session; the archive connection is opened lazily
//! by the first pull and then reused by every following pull of that
//! session until the window drains or an exchange fails.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ClientSlot, ConnectionCache};
use crate::concurrent_map::ShardedMap;
use crate::config::GatewayConfig;
use crate::dds::{DdsError, DdsErrorKind, PullOutcome, RetrievalClient, RetrievalClientConfig};
use crate::error::GatewayError;
use crate::model::{ArchiveStatus, RawMessage, RawMessageBlock, SearchCriteria, SessionKey};
use crate::sources::{ArchiveEndpoint, EndpointSource, NetlistStore};

const PHASE_CONNECTING: &str = "connecting";
const PHASE_AUTHENTICATING: &str = "authenticating";
const PHASE_SEARCHCRIT: &str = "sending searchcrit";
const PHASE_PULL: &str = "getting message block";
const PHASE_STATUS: &str = "getting archive status";

/// Search criteria stored per session.
#[derive(Debug, Default)]
pub struct CriteriaStore {
    map: ShardedMap<SessionKey, Arc<SearchCriteria>>,
}

impl CriteriaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, session: SessionKey, criteria: SearchCriteria) {
        self.map.insert(session, Arc::new(criteria));
    }

    pub fn get(&self, session: &SessionKey) -> Option<Arc<SearchCriteria>> {
        self.map.get(session)
    }

    pub fn remove(&self, session: &SessionKey) -> bool {
        self.map.remove(session).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Retrieval timeouts and defaults.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub client: RetrievalClientConfig,
    /// How long one pull lets the archive wait for data.
    pub pull_timeout: Duration,
    /// `since` used by [`RetrievalOrchestrator::get_single_message`].
    pub single_message_lookback: String,
}

impl RetrievalSettings {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            client: RetrievalClientConfig::from_gateway(config),
            pull_timeout: config.pull_timeout(),
            single_message_lookback: config.single_message_lookback.clone(),
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from_gateway(&GatewayConfig::default())
    }
}

/// Map a client failure to what the caller sees.
pub fn map_dds_error(source_name: &str, phase: &str, err: &DdsError) -> GatewayError {
    match err.kind() {
        DdsErrorKind::Connect => GatewayError::BadConfig {
            source_name: source_name.to_string(),
            detail: err.to_string(),
        },
        DdsErrorKind::Protocol | DdsErrorKind::Server => GatewayError::Protocol {
            phase: phase.to_string(),
            detail: err.to_string(),
        },
        DdsErrorKind::Io => GatewayError::SocketClosed {
            source_name: source_name.to_string(),
            detail: err.to_string(),
        },
    }
}

async fn abandon(mut client: RetrievalClient) {
    if let Err(err) = client.close().await {
        tracing::debug!(host = client.host(), error = %err, "Close after failed handshake");
    }
}

pub struct RetrievalOrchestrator {
    cache: Arc<ConnectionCache>,
    criteria: CriteriaStore,
    endpoints: Arc<dyn EndpointSource>,
    netlists: Arc<dyn NetlistStore>,
    settings: RetrievalSettings,
}

impl std::fmt::Debug for RetrievalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalOrchestrator")
            .field("criteria", &self.criteria.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RetrievalOrchestrator {
    pub fn new(
        cache: Arc<ConnectionCache>,
        endpoints: Arc<dyn EndpointSource>,
        netlists: Arc<dyn NetlistStore>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            cache,
            criteria: CriteriaStore::new(),
            endpoints,
            netlists,
            settings,
        }
    }

    pub fn criteria_store(&self) -> &CriteriaStore {
        &self.criteria
    }

    /// Store new criteria for `session`, dropping any retrieval in progress.
    ///
    /// No network I/O; the connection is opened by the next pull. Eviction
    /// and the store happen under the session slot, so a pull queued behind
    /// this call sees the new criteria.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %session))]
    pub async fn submit_criteria(&self, session: &SessionKey, criteria: SearchCriteria) {
        let mut slot = self.cache.retrieval().slot(session.clone()).await;
        self.replace_criteria(&mut slot, session, criteria).await;
    }

    async fn replace_criteria(
        &self,
        slot: &mut ClientSlot<RetrievalClient>,
        session: &SessionKey,
        criteria: SearchCriteria,
    ) {
        if slot.evict().await {
            tracing::info!("New criteria replaced an open retrieval");
        }
        self.criteria.put(session.clone(), criteria);
    }

    pub fn get_criteria(&self, session: &SessionKey) -> Result<SearchCriteria, GatewayError> {
        self.criteria
            .get(session)
            .map(|c| (*c).clone())
            .ok_or_else(|| GatewayError::NotFound("No search criteria stored for this session.".into()))
    }

    /// Pull the next block for `session`, connecting first if needed.
    ///
    /// A drained window returns the final block and forgets the criteria, so
    /// the next pull needs new criteria. Any failure closes the connection.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %session))]
    pub async fn pull_next_block(&self, session: &SessionKey) -> Result<RawMessageBlock, GatewayError> {
        let mut slot = self.cache.retrieval().slot(session.clone()).await;
        self.pull_locked(&mut slot, session).await
    }

    /// Pull with the session slot held. Criteria are read here, under the
    /// slot, never before it.
    async fn pull_locked(
        &self,
        slot: &mut ClientSlot<RetrievalClient>,
        session: &SessionKey,
    ) -> Result<RawMessageBlock, GatewayError> {
        let Some(criteria) = self.criteria.get(session) else {
            slot.evict().await;
            return Err(GatewayError::MissingPrerequisite(
                "Search criteria must be submitted before pulling messages.".into(),
            ));
        };

        if !slot.is_occupied() {
            let client = self.open_retrieval(&criteria).await?;
            slot.put(client).await;
        }
        let Some(client) = slot.client_mut() else {
            return Err(GatewayError::SocketClosed {
                source_name: "(unknown)".into(),
                detail: "cached client vanished".into(),
            });
        };

        let host = client.host().to_string();
        match client.pull_block(self.settings.pull_timeout).await {
            Ok(PullOutcome::Block(block)) => Ok(block),
            Ok(PullOutcome::Exhausted(block)) => {
                slot.evict().await;
                self.criteria.remove(session);
                tracing::info!(messages = block.messages.len(), "Retrieval finished");
                Ok(block)
            }
            Err(err) => {
                slot.evict().await;
                tracing::warn!(host = %host, error = %err, "Retrieval failed");
                Err(map_dds_error(&host, PHASE_PULL, &err))
            }
        }
    }

    /// Most recent message for one platform/transport id.
    ///
    /// Stores a lookback criteria for the session, pulls one block and
    /// closes the connection whatever the outcome.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %session, id = %id))]
    pub async fn get_single_message(
        &self,
        session: &SessionKey,
        id: &str,
    ) -> Result<RawMessage, GatewayError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(GatewayError::MissingPrerequisite(
                "A platform or transport id is required.".into(),
            ));
        }
        let lookback = &self.settings.single_message_lookback;
        let mut slot = self.cache.retrieval().slot(session.clone()).await;
        self.replace_criteria(&mut slot, session, SearchCriteria::for_platform(id, lookback.as_str()))
            .await;
        let result = self.pull_locked(&mut slot, session).await;
        slot.evict().await;
        drop(slot);

        let block = result?;
        block.messages.into_iter().next().ok_or_else(|| {
            GatewayError::NotFound(format!("No message for '{id}' since {lookback}."))
        })
    }

    /// One-shot archive status; the connection is never cached.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn archive_status(&self, source: Option<&str>) -> Result<ArchiveStatus, GatewayError> {
        let endpoint = self.resolve_endpoint(source).await?;
        let mut client = RetrievalClient::connect(
            &endpoint.host,
            endpoint.port,
            self.settings.client.clone(),
        )
        .await
        .map_err(|e| map_dds_error(&endpoint.name, PHASE_CONNECTING, &e))?;

        let result = async {
            client
                .authenticate(&endpoint.username, endpoint.password.as_deref())
                .await
                .map_err(|e| map_dds_error(&endpoint.name, PHASE_AUTHENTICATING, &e))?;
            client
                .status()
                .await
                .map_err(|e| map_dds_error(&endpoint.name, PHASE_STATUS, &e))
        }
        .await;
        abandon(client).await;
        result
    }

    async fn resolve_endpoint(&self, name: Option<&str>) -> Result<ArchiveEndpoint, GatewayError> {
        let label = name.unwrap_or("(default)");
        match self.endpoints.resolve_archive_endpoint(name).await {
            Ok(Some(endpoint)) => Ok(endpoint),
            Ok(None) => Err(GatewayError::BadConfig {
                source_name: label.to_string(),
                detail: "no usable archive source configured".into(),
            }),
            Err(err) => Err(GatewayError::BadConfig {
                source_name: label.to_string(),
                detail: err.to_string(),
            }),
        }
    }

    /// Connect, authenticate, push netlists and criteria.
    async fn open_retrieval(&self, criteria: &SearchCriteria) -> Result<RetrievalClient, GatewayError> {
        let endpoint = self.resolve_endpoint(None).await?;
        tracing::debug!(
            source = %endpoint.name,
            host = %endpoint.host,
            port = endpoint.port,
            "Opening retrieval"
        );
        let mut client = RetrievalClient::connect(
            &endpoint.host,
            endpoint.port,
            self.settings.client.clone(),
        )
        .await
        .map_err(|e| map_dds_error(&endpoint.name, PHASE_CONNECTING, &e))?;

        match self.handshake(&mut client, &endpoint, criteria).await {
            Ok(()) => Ok(client),
            Err(err) => {
                tracing::warn!(source = %endpoint.name, error = %err, "Retrieval setup failed");
                abandon(client).await;
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        client: &mut RetrievalClient,
        endpoint: &ArchiveEndpoint,
        criteria: &SearchCriteria,
    ) -> Result<(), GatewayError> {
        client
            .authenticate(&endpoint.username, endpoint.password.as_deref())
            .await
            .map_err(|e| map_dds_error(&endpoint.name, PHASE_AUTHENTICATING, &e))?;

        for name in &criteria.netlist_names {
            let list = match self.netlists.resolve_network_list(name).await {
                Ok(Some(list)) => list,
                Ok(None) => {
                    tracing::warn!(netlist = %name, "Unknown network list skipped");
                    continue;
                }
                Err(err) => {
                    return Err(GatewayError::BadConfig {
                        source_name: endpoint.name.clone(),
                        detail: format!("cannot read network list {name}: {err}"),
                    });
                }
            };
            client
                .push_netlist(&list)
                .await
                .map_err(|e| map_dds_error(&endpoint.name, &format!("sending netlist {name}"), &e))?;
        }

        client
            .push_criteria(criteria)
            .await
            .map_err(|e| map_dds_error(&endpoint.name, PHASE_SEARCHCRIT, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ConfigEndpointSource, StaticNetlistStore};

    fn orchestrator(endpoints: ConfigEndpointSource) -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(
            Arc::new(ConnectionCache::new()),
            Arc::new(endpoints),
            Arc::new(StaticNetlistStore::default()),
            RetrievalSettings::default(),
        )
    }

    #[test]
    fn error_mapping_by_kind() {
        let refused = DdsError::ConnectTimeout {
            host: "h".into(),
            port: 1,
        };
        assert!(matches!(
            map_dds_error("main", PHASE_CONNECTING, &refused),
            GatewayError::BadConfig { .. }
        ));

        let server = DdsError::Server {
            code: 12,
            errno: 0,
            message: "bad".into(),
        };
        let mapped = map_dds_error("main", PHASE_SEARCHCRIT, &server);
        assert!(mapped.to_string().starts_with("Error while sending searchcrit"));

        assert!(matches!(
            map_dds_error("main", PHASE_PULL, &DdsError::Disconnected),
            GatewayError::SocketClosed { .. }
        ));
    }

    #[tokio::test]
    async fn pull_without_criteria_is_missing_prerequisite() {
        let orch = orchestrator(ConfigEndpointSource::default());
        let err = orch.pull_next_block(&"s".into()).await.unwrap_err();
        assert!(matches!(err, GatewayError::MissingPrerequisite(_)));
    }

    #[tokio::test]
    async fn no_source_configured_is_bad_config() {
        let orch = orchestrator(ConfigEndpointSource::default());
        let session = SessionKey::from("s");
        orch.submit_criteria(&session, SearchCriteria::default()).await;
        let err = orch.pull_next_block(&session).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadConfig { .. }));
        assert!(!orch.cache.retrieval().contains(&session).await);
    }

    #[tokio::test]
    async fn criteria_round_trip_and_isolation() {
        let orch = orchestrator(ConfigEndpointSource::default());
        let a = SessionKey::from("a");
        let b = SessionKey::from("b");
        let crit = SearchCriteria::for_platform("P1", "now - 1 hour");
        orch.submit_criteria(&a, crit.clone()).await;
        assert_eq!(orch.get_criteria(&a).unwrap(), crit);
        assert!(matches!(orch.get_criteria(&b), Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn blank_single_message_id_rejected() {
        let orch = orchestrator(ConfigEndpointSource::default());
        let err = orch.get_single_message(&"s".into(), "  ").await.unwrap_err();
        assert!(matches!(err, GatewayError::MissingPrerequisite(_)));
        assert!(orch.criteria_store().is_empty());
    }

    proptest::proptest! {
        #[test]
        fn criteria_store_keeps_sessions_apart(
            ops in proptest::collection::vec((0u8..4, proptest::option::of(0u32..100)), 1..40)
        ) {
            let store = CriteriaStore::new();
            let mut model = std::collections::HashMap::new();
            for (session, channel) in ops {
                let key = SessionKey::new(format!("s{session}"));
                match channel {
                    Some(ch) => {
                        let crit = SearchCriteria { goes_channels: vec![ch], ..SearchCriteria::default() };
                        store.put(key.clone(), crit.clone());
                        model.insert(key, crit);
                    }
                    None => {
                        proptest::prop_assert_eq!(store.remove(&key), model.remove(&key).is_some());
                    }
                }
            }
            proptest::prop_assert_eq!(store.len(), model.len());
            for (key, crit) in &model {
                let stored = store.get(key);
                proptest::prop_assert_eq!(stored.as_deref(), Some(crit));
            }
        }
    }
}
