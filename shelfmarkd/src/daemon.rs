use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use shelfmark_api::{LibraryClient, SessionClient};

use crate::credentials::{CredentialCache, Session};
use crate::store::LibraryStore;
use crate::sync::governor::RateGovernor;
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::remote::RemoteClient;
use crate::sync::router::{RoutingAdapter, SyncSettings};
use crate::sync::tracker::ChangeTracker;
use crate::sync::triggers::{SyncEvent, SyncHandle, SyncTriggerManager, TriggerConfig};

const DEFAULT_BASE_URL: &str = "https://api.shelfmark.app";
const DEFAULT_DEBOUNCE_MS: u64 = 2000;
const DEFAULT_PERIODIC_SECS: u64 = 300;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 3;
const DEFAULT_PROBE_SECS: u64 = 15;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub base_url: String,
    pub database_url: Option<String>,
    pub sync_enabled: bool,
    pub debounce: Duration,
    pub periodic: Duration,
    pub reconnect_delay: Duration,
    pub probe_interval: Duration,
    pub backoff_base: Duration,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url =
            std::env::var("SHELFMARK_API_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let database_url = std::env::var("SHELFMARK_DB_URL").ok();
        let sync_enabled = read_bool_env("SHELFMARK_SYNC_ENABLED", true);
        let debounce =
            Duration::from_millis(read_u64_env("SHELFMARK_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS));
        let periodic =
            Duration::from_secs(read_u64_env("SHELFMARK_PERIODIC_SECS", DEFAULT_PERIODIC_SECS));
        let reconnect_delay = Duration::from_secs(read_u64_env(
            "SHELFMARK_RECONNECT_DELAY_SECS",
            DEFAULT_RECONNECT_DELAY_SECS,
        ));
        let probe_interval =
            Duration::from_secs(read_u64_env("SHELFMARK_PROBE_SECS", DEFAULT_PROBE_SECS));
        let backoff_base = Duration::from_millis(read_u64_env(
            "SHELFMARK_BACKOFF_BASE_MS",
            DEFAULT_BACKOFF_BASE_MS,
        ));
        let access_token = std::env::var("SHELFMARK_ACCESS_TOKEN").ok();
        let refresh_token = std::env::var("SHELFMARK_REFRESH_TOKEN").ok();

        Ok(Self {
            base_url,
            database_url,
            sync_enabled,
            debounce,
            periodic,
            reconnect_delay,
            probe_interval,
            backoff_base,
            access_token,
            refresh_token,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    router: Arc<RoutingAdapter>,
    manager: Arc<SyncTriggerManager>,
    handle: SyncHandle,
    remote: Arc<RemoteClient>,
    events: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = match &config.database_url {
            Some(url) => LibraryStore::new(url)
                .await
                .with_context(|| format!("failed to open library store at {url}"))?,
            None => LibraryStore::new_default()
                .await
                .context("failed to open the default library store")?,
        };
        let tracker = ChangeTracker::from_pool(store.pool().clone());
        tracker
            .init()
            .await
            .context("failed to initialize the change queue")?;

        let api = LibraryClient::with_base_url(&config.base_url)
            .context("invalid remote API base url")?;
        let session_client = SessionClient::with_base_url(&config.base_url)
            .context("invalid remote API base url")?;
        let credentials = Arc::new(match (&config.access_token, &config.refresh_token) {
            (Some(access), Some(refresh)) => CredentialCache::with_session(
                session_client,
                Session {
                    access_token: access.clone(),
                    refresh_token: refresh.clone(),
                },
            ),
            _ => CredentialCache::new(session_client),
        });

        let remote = Arc::new(RemoteClient::new(api, credentials.clone()));
        let governor = Arc::new(RateGovernor::new(config.backoff_base));
        let settings = Arc::new(SyncSettings::new(config.sync_enabled));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            tracker.clone(),
            remote.clone(),
            governor.clone(),
        ));
        let (manager, handle, events) = SyncTriggerManager::new(
            orchestrator,
            settings.clone(),
            credentials.clone(),
            TriggerConfig {
                debounce: config.debounce,
                periodic: config.periodic,
                reconnect_delay: config.reconnect_delay,
            },
        );
        let router = Arc::new(RoutingAdapter::new(
            store,
            tracker,
            remote.clone(),
            governor,
            settings,
            credentials,
            handle.clone(),
        ));

        Ok(Self {
            config,
            router,
            manager,
            handle,
            remote,
            events: Some(events),
        })
    }

    /// The library front door for anything embedding the daemon.
    pub fn router(&self) -> Arc<RoutingAdapter> {
        Arc::clone(&self.router)
    }

    pub fn triggers(&self) -> Arc<SyncTriggerManager> {
        Arc::clone(&self.manager)
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            base_url = %self.config.base_url,
            sync_enabled = self.config.sync_enabled,
            "shelfmarkd started"
        );

        let mut events = self
            .events
            .take()
            .context("daemon runtime already consumed its event stream")?;
        let events_handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SyncEvent::CycleCompleted(report) => {
                        info!(
                            pushed = report.pushed.total(),
                            pulled = report.pulled.total(),
                            deleted = report.deleted.total(),
                            conflicts = report.conflicts.len(),
                            "sync cycle completed"
                        );
                    }
                    SyncEvent::RateLimited { remaining_ms } => {
                        warn!(remaining_ms, "sync paused by rate limit");
                    }
                    SyncEvent::SessionExpired => {
                        warn!("session expired, sign in again to resume sync");
                    }
                }
            }
        });

        let probe_remote = Arc::clone(&self.remote);
        let probe_manager = Arc::clone(&self.manager);
        let probe_interval = self.config.probe_interval;
        let probe_handle = tokio::spawn(async move {
            let mut reachable = probe_remote.ping().await;
            if !reachable {
                warn!("remote service is unreachable at startup");
            }
            loop {
                tokio::time::sleep(probe_interval).await;
                let now = probe_remote.ping().await;
                if now && !reachable {
                    probe_manager.notify_online();
                }
                reachable = now;
            }
        });

        self.manager.start();
        // flush anything queued while the daemon was down
        self.handle.schedule_debounced();

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        self.manager.stop();
        probe_handle.abort();
        events_handle.abort();
        Ok(())
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    parse_u64(std::env::var(name).ok(), default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    parse_bool(std::env::var(name).ok(), default)
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
