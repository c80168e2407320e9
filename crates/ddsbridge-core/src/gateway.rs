//! The resource-boundary facade.
//!
//! [`Gateway`] bundles the retrieval and event orchestrators over one
//! shared [`ConnectionCache`], adds session teardown, and owns the
//! background reaper that closes idle or orphaned clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::appmon::{EventOrchestrator, EventSettings};
use crate::cache::ConnectionCache;
use crate::config::{Config, GatewayConfig};
use crate::error::GatewayError;
use crate::model::{AppEvent, AppId, ArchiveStatus, RawMessage, RawMessageBlock, SearchCriteria, SessionKey};
use crate::retrieval::{RetrievalOrchestrator, RetrievalSettings};
use crate::sources::{
    ConfigEndpointSource, EndpointSource, NetlistStore, StaticNetlistStore, WorkerRegistry,
};

/// Result of one reaper sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub retrieval: usize,
    pub events: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.retrieval + self.events
    }
}

pub struct Gateway {
    cache: Arc<ConnectionCache>,
    retrieval: RetrievalOrchestrator,
    events: EventOrchestrator,
    idle_threshold: Duration,
    reap_interval: Duration,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("retrieval", &self.retrieval)
            .field("events", &self.events)
            .field("idle_threshold", &self.idle_threshold)
            .field("reap_interval", &self.reap_interval)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        config: &GatewayConfig,
        endpoints: Arc<dyn EndpointSource>,
        netlists: Arc<dyn NetlistStore>,
        workers: Arc<dyn WorkerRegistry>,
    ) -> Self {
        let cache = Arc::new(ConnectionCache::new());
        let retrieval = RetrievalOrchestrator::new(
            Arc::clone(&cache),
            endpoints,
            netlists,
            RetrievalSettings::from_gateway(config),
        );
        let events = EventOrchestrator::new(Arc::clone(&cache), workers, EventSettings::from_gateway(config));
        Self {
            cache,
            retrieval,
            events,
            idle_threshold: config.idle_client_threshold(),
            reap_interval: config.reap_interval(),
        }
    }

    /// Gateway with sources and netlists taken from `config`.
    pub fn from_config(config: &Config, workers: Arc<dyn WorkerRegistry>) -> Self {
        Self::new(
            &config.gateway,
            Arc::new(ConfigEndpointSource::from_config(config)),
            Arc::new(StaticNetlistStore::from_config(config)),
            workers,
        )
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn retrieval(&self) -> &RetrievalOrchestrator {
        &self.retrieval
    }

    pub fn events(&self) -> &EventOrchestrator {
        &self.events
    }

    /// Store criteria for the session; any open retrieval is discarded.
    pub async fn submit_search_criteria(&self, session: &SessionKey, criteria: SearchCriteria) {
        self.retrieval.submit_criteria(session, criteria).await;
    }

    pub fn get_search_criteria(&self, session: &SessionKey) -> Result<SearchCriteria, GatewayError> {
        self.retrieval.get_criteria(session)
    }

    pub async fn pull_next_message_block(&self, session: &SessionKey) -> Result<RawMessageBlock, GatewayError> {
        self.retrieval.pull_next_block(session).await
    }

    pub async fn get_single_message(&self, session: &SessionKey, id: &str) -> Result<RawMessage, GatewayError> {
        self.retrieval.get_single_message(session, id).await
    }

    pub async fn get_worker_events(&self, session: &SessionKey, app_id: AppId) -> Result<Vec<AppEvent>, GatewayError> {
        self.events.poll_events(session, app_id).await
    }

    pub async fn get_archive_status(&self, source: Option<&str>) -> Result<ArchiveStatus, GatewayError> {
        self.retrieval.archive_status(source).await
    }

    /// Close every client of `session` and forget its criteria.
    ///
    /// Returns the number of clients closed.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %session))]
    pub async fn end_session(&self, session: &SessionKey) -> usize {
        self.retrieval.criteria_store().remove(session);
        let closed = self.cache.end_session(session).await;
        tracing::info!(closed, "Session ended");
        closed
    }

    /// One sweep: idle retrieval clients and event clients of dead or
    /// restarted workers. Slots in use are skipped.
    pub async fn reap_idle(&self) -> ReapReport {
        let threshold = self.idle_threshold;
        let retrieval = self
            .cache
            .retrieval()
            .reap(|_, _, idle| idle > threshold)
            .await;
        let events = self.events.reap_stale().await;
        let report = ReapReport { retrieval, events };
        tracing::debug!(retrieval, events, "Reaper sweep");
        report
    }

    /// Run [`Self::reap_idle`] every `reap_interval` until the handle is
    /// shut down or dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let gateway = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(gateway.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing can be idle yet.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        gateway.reap_idle().await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("Reaper shutting down");
                        break;
                    }
                }
            }
        });
        ReaperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Stops the background reaper.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the reaper and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "Reaper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::StaticWorkerRegistry;

    fn gateway() -> Gateway {
        Gateway::from_config(&Config::default(), Arc::new(StaticWorkerRegistry::new()))
    }

    #[tokio::test]
    async fn criteria_round_trip_and_end_session() {
        let gw = gateway();
        let session = SessionKey::from("s1");
        assert!(matches!(
            gw.get_search_criteria(&session),
            Err(GatewayError::NotFound(_))
        ));

        let criteria = SearchCriteria {
            since: Some("now - 1 hour".into()),
            ..SearchCriteria::default()
        };
        gw.submit_search_criteria(&session, criteria.clone()).await;
        assert_eq!(gw.get_search_criteria(&session).unwrap(), criteria);

        assert_eq!(gw.end_session(&session).await, 0);
        assert!(gw.get_search_criteria(&session).is_err());
    }

    #[tokio::test]
    async fn pull_without_criteria_is_missing_prerequisite() {
        let gw = gateway();
        let err = gw.pull_next_message_block(&"s".into()).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn pull_with_no_sources_is_bad_config() {
        let gw = gateway();
        let session = SessionKey::from("s");
        gw.submit_search_criteria(&session, SearchCriteria::default()).await;
        let err = gw.pull_next_message_block(&session).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadConfig { .. }));
        assert!(!gw.cache().retrieval().contains(&session).await);
    }

    #[tokio::test]
    async fn empty_sweep_reports_nothing() {
        assert_eq!(gateway().reap_idle().await, ReapReport::default());
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let gw = Arc::new(gateway());
        let handle = gw.spawn_reaper();
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap();
    }
}
