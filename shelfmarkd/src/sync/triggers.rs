use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout};
use tracing::{debug, info};

use crate::credentials::CredentialCache;
use crate::sync::orchestrator::{CycleError, SyncOrchestrator, SyncReport};
use crate::sync::router::SyncSettings;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("sync is unavailable (enabled: {enabled}, authenticated: {authenticated})")]
    Unavailable { enabled: bool, authenticated: bool },
    #[error("a sync cycle is already running")]
    Busy,
    #[error(transparent)]
    Cycle(CycleError),
}

/// Outcome notifications for whoever fronts the daemon (CLI, UI shell).
#[derive(Debug, Clone)]
pub enum SyncEvent {
    CycleCompleted(SyncReport),
    RateLimited { remaining_ms: u64 },
    SessionExpired,
}

/// Cheap cloneable handle for requesting a debounced sync from anywhere.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl SyncHandle {
    pub fn new(tx: mpsc::UnboundedSender<()>) -> Self {
        Self { tx }
    }

    /// Requests a sync soon. Bursts collapse into a single cycle; the
    /// request is dropped silently once the manager has stopped.
    pub fn schedule_debounced(&self) {
        let _ = self.tx.send(());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TriggerConfig {
    /// Quiet period after the last schedule request before a cycle fires.
    pub debounce: Duration,
    /// Fixed interval between background cycles.
    pub periodic: Duration,
    /// Stabilization delay between an online signal and the reconnect cycle.
    pub reconnect_delay: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            periodic: Duration::from_secs(300),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

/// Owns the four ways a sync cycle starts: debounced requests, the periodic
/// timer, reconnect signals, and explicit `sync_now`. Every trigger re-checks
/// availability at fire time; overlap is resolved by the orchestrator's
/// single-cycle guard.
pub struct SyncTriggerManager {
    orchestrator: Arc<SyncOrchestrator>,
    settings: Arc<SyncSettings>,
    credentials: Arc<CredentialCache>,
    events: mpsc::UnboundedSender<SyncEvent>,
    config: TriggerConfig,
    debounce_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    online_tx: mpsc::UnboundedSender<()>,
    online_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncTriggerManager {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        settings: Arc<SyncSettings>,
        credentials: Arc<CredentialCache>,
        config: TriggerConfig,
    ) -> (Arc<Self>, SyncHandle, mpsc::UnboundedReceiver<SyncEvent>) {
        let (debounce_tx, debounce_rx) = mpsc::unbounded_channel();
        let (online_tx, online_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            orchestrator,
            settings,
            credentials,
            events: events_tx,
            config,
            debounce_rx: Mutex::new(Some(debounce_rx)),
            online_tx,
            online_rx: Mutex::new(Some(online_rx)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        });
        (manager, SyncHandle::new(debounce_tx), events_rx)
    }

    /// Spawns the background trigger tasks. Idempotent; a second call is a
    /// no-op. Each trigger runs its cycle on a detached task so that
    /// [`stop`](Self::stop) only cancels the timer loops, never a cycle that
    /// has already drained the change queue.
    pub fn start(self: &Arc<Self>) {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let mut handles = Vec::new();

        if let Some(mut rx) = self.take(&self.debounce_rx) {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    // restart the quiet period for every further request
                    loop {
                        match timeout(manager.config.debounce, rx.recv()).await {
                            Ok(Some(())) => continue,
                            Ok(None) => return,
                            Err(_) => break,
                        }
                    }
                    let runner = Arc::clone(&manager);
                    tokio::spawn(async move {
                        runner.background_cycle("debounce").await;
                    });
                }
            }));
        }

        if let Some(mut rx) = self.take(&self.online_rx) {
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    tokio::time::sleep(manager.config.reconnect_delay).await;
                    // collapse the signals that piled up while waiting
                    while rx.try_recv().is_ok() {}
                    info!("connectivity restored, syncing");
                    let runner = Arc::clone(&manager);
                    tokio::spawn(async move {
                        runner.background_cycle("reconnect").await;
                    });
                }
            }));
        }

        {
            let manager = Arc::clone(self);
            let period = self.config.periodic;
            handles.push(tokio::spawn(async move {
                let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let runner = Arc::clone(&manager);
                    tokio::spawn(async move {
                        runner.background_cycle("periodic").await;
                    });
                }
            }));
        }

        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
    }

    /// Signals that the remote service became reachable again.
    pub fn notify_online(&self) {
        let _ = self.online_tx.send(());
    }

    /// Immediate, user-visible sync. Unlike the background triggers this
    /// reports unavailability and cycle failures to the caller.
    pub async fn sync_now(&self) -> Result<SyncReport, TriggerError> {
        let enabled = self.settings.is_enabled();
        let authenticated = self.credentials.is_authenticated().await;
        if !(enabled && authenticated) {
            return Err(TriggerError::Unavailable {
                enabled,
                authenticated,
            });
        }
        match self.orchestrator.run_cycle().await {
            Ok(report) => {
                let _ = self.events.send(SyncEvent::CycleCompleted(report.clone()));
                Ok(report)
            }
            Err(CycleError::Busy) => Err(TriggerError::Busy),
            Err(CycleError::SessionExpired) => {
                let _ = self.events.send(SyncEvent::SessionExpired);
                Err(TriggerError::Cycle(CycleError::SessionExpired))
            }
            Err(err) => Err(TriggerError::Cycle(err)),
        }
    }

    /// Stops future triggers. A cycle already running is left to finish.
    pub fn stop(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn background_cycle(&self, source: &str) {
        if !(self.settings.is_enabled() && self.credentials.is_authenticated().await) {
            debug!(source, "skipping sync trigger, sync unavailable");
            return;
        }
        match self.orchestrator.run_cycle().await {
            Ok(report) => {
                let _ = self.events.send(SyncEvent::CycleCompleted(report));
            }
            Err(CycleError::Busy) => debug!(source, "a sync cycle is already running"),
            Err(CycleError::RateLimited { remaining_ms }) => {
                let _ = self.events.send(SyncEvent::RateLimited { remaining_ms });
            }
            Err(CycleError::SessionExpired) => {
                let _ = self.events.send(SyncEvent::SessionExpired);
            }
            Err(err) => debug!(source, error = %err, "background sync failed"),
        }
    }

    fn take(
        &self,
        slot: &Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    ) -> Option<mpsc::UnboundedReceiver<()>> {
        slot.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Session;
    use crate::store::LibraryStore;
    use crate::sync::governor::RateGovernor;
    use crate::sync::remote::RemoteClient;
    use crate::sync::tracker::ChangeTracker;
    use serde_json::json;
    use shelfmark_api::{EntityKind, LibraryClient, SessionClient};
    use sqlx::SqlitePool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn manager_against(
        uri: &str,
        config: TriggerConfig,
    ) -> (
        Arc<SyncTriggerManager>,
        SyncHandle,
        mpsc::UnboundedReceiver<SyncEvent>,
        LibraryStore,
        ChangeTracker,
    ) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = LibraryStore::from_pool(pool.clone());
        store.init().await.unwrap();
        let tracker = ChangeTracker::from_pool(pool);
        tracker.init().await.unwrap();

        let api = LibraryClient::with_base_url(uri).unwrap();
        let session_client = SessionClient::with_base_url(uri).unwrap();
        let credentials = Arc::new(CredentialCache::with_session(
            session_client,
            Session {
                access_token: "t".into(),
                refresh_token: "r".into(),
            },
        ));
        let remote = Arc::new(RemoteClient::new(api, credentials.clone()));
        let governor = Arc::new(RateGovernor::default());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            tracker.clone(),
            remote,
            governor,
        ));
        let settings = Arc::new(SyncSettings::new(true));
        let (manager, handle, events) =
            SyncTriggerManager::new(orchestrator, settings, credentials, config);
        (manager, handle, events, store, tracker)
    }

    async fn mount_empty_listings(server: &MockServer, expected_cycles: u64) {
        Mock::given(method("GET"))
            .and(path("/v1/papers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "items": [], "total": 0, "limit": 100, "offset": 0 }
            })))
            .expect(expected_cycles)
            .mount(server)
            .await;
        for kind in ["collections", "annotations"] {
            Mock::given(method("GET"))
                .and(path(format!("/v1/{kind}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "success": true,
                    "data": []
                })))
                .expect(expected_cycles)
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn burst_of_schedule_requests_runs_one_cycle() {
        let server = MockServer::start().await;
        mount_empty_listings(&server, 1).await;

        let config = TriggerConfig {
            debounce: Duration::from_millis(50),
            periodic: Duration::from_secs(3600),
            reconnect_delay: Duration::from_millis(10),
        };
        let (manager, handle, mut events, _store, _tracker) =
            manager_against(&server.uri(), config).await;
        manager.start();

        handle.schedule_debounced();
        handle.schedule_debounced();
        handle.schedule_debounced();

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("debounced cycle should fire")
            .expect("manager still running");
        assert!(matches!(event, SyncEvent::CycleCompleted(_)));

        manager.stop();
        // mock expectations verify exactly one listing round happened
    }

    #[tokio::test]
    async fn concurrent_manual_triggers_run_at_most_one_cycle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/papers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(100))
                    .set_body_json(json!({
                        "success": true,
                        "data": { "items": [], "total": 0, "limit": 100, "offset": 0 }
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;
        for kind in ["collections", "annotations"] {
            Mock::given(method("GET"))
                .and(path(format!("/v1/{kind}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "success": true,
                    "data": []
                })))
                .expect(1)
                .mount(&server)
                .await;
        }

        let (manager, _handle, _events, _store, _tracker) =
            manager_against(&server.uri(), TriggerConfig::default()).await;

        let (a, b, c) = tokio::join!(manager.sync_now(), manager.sync_now(), manager.sync_now());
        let outcomes = [a, b, c];
        let completed = outcomes.iter().filter(|result| result.is_ok()).count();
        let busy = outcomes
            .iter()
            .filter(|result| matches!(result, Err(TriggerError::Busy)))
            .count();

        assert_eq!(completed, 1);
        assert_eq!(busy, 2);
    }

    #[tokio::test]
    async fn manual_trigger_reports_unavailability() {
        let server = MockServer::start().await;
        let (manager, _handle, _events, _store, _tracker) =
            manager_against(&server.uri(), TriggerConfig::default()).await;
        manager.settings.set_enabled(false);

        let err = manager.sync_now().await.unwrap_err();
        assert!(matches!(
            err,
            TriggerError::Unavailable {
                enabled: false,
                authenticated: true
            }
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnect_signal_syncs_after_the_stabilization_delay() {
        let server = MockServer::start().await;
        mount_empty_listings(&server, 1).await;

        let config = TriggerConfig {
            debounce: Duration::from_secs(3600),
            periodic: Duration::from_secs(3600),
            reconnect_delay: Duration::from_millis(20),
        };
        let (manager, _handle, mut events, _store, _tracker) =
            manager_against(&server.uri(), config).await;
        manager.start();

        manager.notify_online();
        manager.notify_online();

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("reconnect cycle should fire")
            .expect("manager still running");
        assert!(matches!(event, SyncEvent::CycleCompleted(_)));
        manager.stop();
    }

    #[tokio::test]
    async fn stopped_manager_ignores_schedule_requests() {
        let server = MockServer::start().await;
        mount_empty_listings(&server, 0).await;

        let config = TriggerConfig {
            debounce: Duration::from_millis(10),
            periodic: Duration::from_secs(3600),
            reconnect_delay: Duration::from_millis(10),
        };
        let (manager, handle, _events, _store, _tracker) =
            manager_against(&server.uri(), config).await;
        manager.start();
        manager.stop();

        handle.schedule_debounced();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // mock expectations verify no request went out
    }

    #[tokio::test]
    async fn stop_lets_an_in_flight_cycle_finish() {
        let server = MockServer::start().await;

        let config = TriggerConfig {
            debounce: Duration::from_millis(20),
            periodic: Duration::from_secs(3600),
            reconnect_delay: Duration::from_secs(3600),
        };
        let (manager, handle, _events, store, tracker) =
            manager_against(&server.uri(), config).await;

        let record = store
            .insert(
                EntityKind::Paper,
                &json!({"title": "Paxos", "authors": [], "reading_status": "New"}),
            )
            .await
            .unwrap();
        tracker
            .record_create(EntityKind::Paper, record.local_id, &record.fields)
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/papers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(300))
                    .set_body_json(json!({
                        "success": true,
                        "data": {
                            "id": "p-1",
                            "title": "Paxos",
                            "authors": [],
                            "status": "New",
                            "version": 1
                        }
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/papers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "items": [{
                        "id": "p-1",
                        "title": "Paxos",
                        "authors": [],
                        "status": "New",
                        "version": 1
                    }],
                    "total": 1, "limit": 100, "offset": 0
                }
            })))
            .mount(&server)
            .await;
        for kind in ["collections", "annotations"] {
            Mock::given(method("GET"))
                .and(path(format!("/v1/{kind}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "success": true,
                    "data": []
                })))
                .mount(&server)
                .await;
        }

        manager.start();
        handle.schedule_debounced();
        // let the debounce elapse and the push get onto the wire
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop();
        tokio::time::sleep(Duration::from_millis(700)).await;

        // the cycle already underway completed instead of being torn down
        // with the change drained but unpushed
        let synced = store
            .get(EntityKind::Paper, record.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(synced.remote_id.as_deref(), Some("p-1"));
        assert_eq!(tracker.len(EntityKind::Paper).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_start_spawns_no_extra_tasks() {
        let server = MockServer::start().await;
        let (manager, _handle, _events, _store, _tracker) =
            manager_against(&server.uri(), TriggerConfig::default()).await;

        manager.start();
        manager.start();

        assert_eq!(manager.tasks.lock().unwrap().len(), 3);
        manager.stop();
    }
}
