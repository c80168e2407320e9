//! Worker event polling with restart detection.
//!
//! Before a cached event client is reused, the worker's status record is
//! checked: a missing record, missing pid or stale heartbeat means the
//! worker is not running; a different pid means it restarted and the
//! cached client is replaced.
//!
//! Pid comparison is approximate: a restart that reuses the same pid
//! between two polls goes unnoticed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::cache::ConnectionCache;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::events::{EventClientConfig, EventStreamClient};
use crate::model::{AppEvent, AppId, Liveness, SessionKey, WorkerStatus};
use crate::sources::WorkerRegistry;

#[derive(Debug, Clone)]
pub struct EventSettings {
    pub client: EventClientConfig,
    /// Heartbeats older than this mean "not running".
    pub liveness: Duration,
}

impl EventSettings {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            client: EventClientConfig::from_gateway(config),
            liveness: config.worker_liveness(),
        }
    }
}

impl Default for EventSettings {
    fn default() -> Self {
        Self::from_gateway(&GatewayConfig::default())
    }
}

pub struct EventOrchestrator {
    cache: Arc<ConnectionCache>,
    workers: Arc<dyn WorkerRegistry>,
    settings: EventSettings,
}

impl std::fmt::Debug for EventOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventOrchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn not_running(app_id: AppId, status: Option<&WorkerStatus>, liveness: Option<Liveness>) -> GatewayError {
    let message = match (status, liveness) {
        (None, _) => format!("appid {app_id} is not running (no status record found)."),
        (Some(s), Some(Liveness::StaleHeartbeat)) => {
            format!("appid {app_id} ({}) is not running (stale heartbeat).", s.app_name)
        }
        (Some(s), _) => format!("appid {app_id} ({}) is not running.", s.app_name),
    };
    GatewayError::NotFound(message)
}

impl EventOrchestrator {
    pub fn new(cache: Arc<ConnectionCache>, workers: Arc<dyn WorkerRegistry>, settings: EventSettings) -> Self {
        Self {
            cache,
            workers,
            settings,
        }
    }

    async fn lookup(&self, app_id: AppId) -> Result<Option<WorkerStatus>, GatewayError> {
        self.workers
            .worker_status(app_id)
            .await
            .map_err(|e| GatewayError::Conflict(format!("Cannot read status of appid {app_id}: {e}")))
    }

    /// New events from worker `app_id` for `session`.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %session))]
    pub async fn poll_events(&self, session: &SessionKey, app_id: AppId) -> Result<Vec<AppEvent>, GatewayError> {
        let mut slot = self.cache.events().slot((session.clone(), app_id)).await;
        // Read under the slot so concurrent polls of one worker act on the
        // status in the order they hold the slot.
        let status = self.lookup(app_id).await?;

        let Some(status) = status else {
            slot.evict().await;
            return Err(not_running(app_id, None, None));
        };
        let liveness = status.liveness(Utc::now(), self.settings.liveness);
        let pid = match (liveness, status.pid) {
            (Liveness::Running, Some(pid)) => pid,
            _ => {
                if slot.evict().await {
                    tracing::info!(app_id, ?liveness, "Worker gone; dropped its event client");
                }
                return Err(not_running(app_id, Some(&status), Some(liveness)));
            }
        };

        let cached_pid = slot.client().map(EventStreamClient::pid);
        if let Some(old_pid) = cached_pid.filter(|old| *old != pid) {
            tracing::info!(app_id, old_pid, new_pid = pid, "Worker restarted");
            slot.evict().await;
        }

        if !slot.is_occupied() {
            let Some(port) = status.event_port else {
                return Ok(Vec::new());
            };
            let client = EventStreamClient::connect(
                app_id,
                status.event_host(),
                port,
                &status.app_name,
                pid,
                self.settings.client.clone(),
            )
            .await
            .map_err(|err| {
                tracing::warn!(app_id, port, error = %err, "Cannot reach worker event port");
                GatewayError::Conflict(format!("Cannot connect to {}.", status.app_name))
            })?;
            slot.put(client).await;
        }

        let Some(client) = slot.client_mut() else {
            return Ok(Vec::new());
        };
        match client.poll_new_events().await {
            Ok(events) => Ok(events),
            Err(err) => {
                slot.evict().await;
                tracing::warn!(app_id, error = %err, "Worker event stream lost");
                Err(GatewayError::Conflict(format!(
                    "Event socket to appid {app_id} closed by app."
                )))
            }
        }
    }

    /// Close cached clients whose worker is gone or restarted.
    ///
    /// Workers whose status cannot be read are left alone.
    pub async fn reap_stale(&self) -> usize {
        let mut app_ids: Vec<AppId> = self.cache.events().keys().into_iter().map(|(_, id)| id).collect();
        app_ids.sort_unstable();
        app_ids.dedup();

        let now = Utc::now();
        let mut live_pid: HashMap<AppId, Option<u32>> = HashMap::new();
        for app_id in app_ids {
            match self.workers.worker_status(app_id).await {
                Ok(Some(status)) => {
                    let pid = (status.liveness(now, self.settings.liveness) == Liveness::Running)
                        .then_some(status.pid)
                        .flatten();
                    live_pid.insert(app_id, pid);
                }
                Ok(None) => {
                    live_pid.insert(app_id, None);
                }
                Err(err) => tracing::debug!(app_id, error = %err, "Worker status unavailable during reap"),
            }
        }

        self.cache
            .events()
            .reap(|(_, app_id), client, _| match live_pid.get(app_id) {
                Some(Some(pid)) => client.pid() != *pid,
                Some(None) => true,
                None => false,
            })
            .await
    }
}
