use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use shelfmark_api::{ChangeOp, EntityKind, ReconcileOp};

use crate::store::{LibraryStore, StoreError};
use crate::sync::governor::RateGovernor;
use crate::sync::mapping::{MappingError, WireMapper};
use crate::sync::remote::{RemoteClient, RemoteError};
use crate::sync::tracker::{ChangeTracker, PendingChange, TrackerError};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("a sync cycle is already running")]
    Busy,
    #[error("rate limited, {remaining_ms} ms until the next attempt")]
    RateLimited { remaining_ms: u64 },
    #[error("session expired, re-authentication required")]
    SessionExpired,
    #[error("no credential is available")]
    NotAuthenticated,
    #[error("remote service unreachable: {0}")]
    Unreachable(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("change queue error: {0}")]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub papers: usize,
    pub collections: usize,
    pub annotations: usize,
}

impl KindCounts {
    fn bump(&mut self, kind: EntityKind) {
        match kind {
            EntityKind::Paper => self.papers += 1,
            EntityKind::Collection => self.collections += 1,
            EntityKind::Annotation => self.annotations += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.papers + self.collections + self.annotations
    }
}

/// A local change the remote service refused because its copy had moved on.
/// The remote copy wins; the pull phase of the same cycle overwrites the
/// local record with the remote state.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub kind: EntityKind,
    pub remote_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub had_local_changes: bool,
    pub pushed: KindCounts,
    pub pulled: KindCounts,
    pub deleted: KindCounts,
    pub conflicts: Vec<Conflict>,
    pub rejected: usize,
}

/// Runs full sync cycles: replay the pending change queue against the remote
/// service, then pull the remote listing and make the local store match it.
/// At most one cycle runs at a time; overlapping callers get
/// [`CycleError::Busy`] instead of a second cycle.
pub struct SyncOrchestrator {
    store: LibraryStore,
    tracker: ChangeTracker,
    remote: Arc<RemoteClient>,
    mapper: WireMapper,
    governor: Arc<RateGovernor>,
    cycle_running: AtomicBool,
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: LibraryStore,
        tracker: ChangeTracker,
        remote: Arc<RemoteClient>,
        governor: Arc<RateGovernor>,
    ) -> Self {
        let mapper = WireMapper::new(store.clone());
        Self {
            store,
            tracker,
            remote,
            mapper,
            governor,
            cycle_running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.cycle_running.load(Ordering::SeqCst)
    }

    pub async fn run_cycle(&self) -> Result<SyncReport, CycleError> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CycleError::Busy);
        }
        let _guard = CycleGuard(&self.cycle_running);

        if self.governor.is_limited() {
            return Err(CycleError::RateLimited {
                remaining_ms: self.governor.remaining_ms(),
            });
        }

        let mut report = SyncReport::default();
        let result = self.cycle_inner(&mut report).await;
        match result {
            Ok(()) => {
                self.governor.clear();
                info!(
                    pushed = report.pushed.total(),
                    pulled = report.pulled.total(),
                    deleted = report.deleted.total(),
                    conflicts = report.conflicts.len(),
                    "sync cycle complete"
                );
                Ok(report)
            }
            Err(err) => {
                match &err {
                    CycleError::RateLimited { .. } | CycleError::Unreachable(_) => {
                        debug!(error = %err, "sync cycle backing off");
                    }
                    other => warn!(error = %other, "sync cycle failed"),
                }
                Err(err)
            }
        }
    }

    async fn cycle_inner(&self, report: &mut SyncReport) -> Result<(), CycleError> {
        // Papers push before annotations so annotation payloads can resolve
        // their paper's remote id in the same cycle.
        for kind in EntityKind::ALL {
            self.push_kind(kind, report).await?;
        }
        for kind in EntityKind::ALL {
            self.pull_kind(kind, report).await?;
        }
        Ok(())
    }

    async fn push_kind(
        &self,
        kind: EntityKind,
        report: &mut SyncReport,
    ) -> Result<(), CycleError> {
        let changes = self.tracker.drain(kind).await?;
        if changes.is_empty() {
            return Ok(());
        }
        report.had_local_changes = true;

        if changes.len() == 1 {
            let mut pending = changes;
            let change = pending.remove(0);
            if let Err(err) = self.push_single(kind, &change, report).await {
                self.requeue(std::iter::once(&change)).await?;
                return Err(self.fail(err));
            }
            return Ok(());
        }

        if let Err(err) = self.push_batch(kind, &changes, report).await {
            self.requeue(changes.iter()).await?;
            return Err(self.fail(err));
        }
        Ok(())
    }

    /// One pending change via its per-entity endpoint.
    async fn push_single(
        &self,
        kind: EntityKind,
        change: &PendingChange,
        report: &mut SyncReport,
    ) -> Result<(), RemoteError> {
        match change.op {
            ChangeOp::Create => {
                let Some(record) = self.record_for(kind, change.local_id).await? else {
                    debug!(kind = %kind, local_id = change.local_id, "skipping create for vanished record");
                    return Ok(());
                };
                let wire = match self.mapper.to_wire(kind, &record.fields, 0).await {
                    Ok(wire) => wire,
                    Err(err) => return self.handle_mapping_failure(change, err, report).await,
                };
                match self.remote.create(kind, &wire).await {
                    Ok(value) => {
                        self.confirm(kind, change.local_id, &value).await;
                        report.pushed.bump(kind);
                        Ok(())
                    }
                    Err(err) => self.handle_push_failure(kind, None, err, report),
                }
            }
            ChangeOp::Update => {
                let Some(record) = self.record_for(kind, change.local_id).await? else {
                    debug!(kind = %kind, local_id = change.local_id, "skipping update for vanished record");
                    return Ok(());
                };
                let Some(remote_id) = record.remote_id.clone() else {
                    warn!(kind = %kind, local_id = change.local_id, "queued update for a record with no remote identity");
                    report.rejected += 1;
                    return Ok(());
                };
                let wire = match self.mapper.to_wire(kind, &record.fields, record.version).await {
                    Ok(wire) => wire,
                    Err(err) => return self.handle_mapping_failure(change, err, report).await,
                };
                match self.remote.update(kind, &remote_id, &wire).await {
                    Ok(value) => {
                        self.confirm(kind, change.local_id, &value).await;
                        report.pushed.bump(kind);
                        Ok(())
                    }
                    Err(err) => self.handle_push_failure(kind, Some(remote_id), err, report),
                }
            }
            ChangeOp::Delete => {
                let Some(remote_id) = change.payload.get("id").and_then(|id| id.as_str()) else {
                    warn!(kind = %kind, local_id = change.local_id, "queued delete carries no remote id");
                    report.rejected += 1;
                    return Ok(());
                };
                match self.remote.delete(kind, remote_id).await {
                    Ok(()) => {
                        report.pushed.bump(kind);
                        Ok(())
                    }
                    Err(err) => {
                        self.handle_push_failure(kind, Some(remote_id.to_string()), err, report)
                    }
                }
            }
        }
    }

    /// Several pending changes of one kind in a single reconcile request.
    async fn push_batch(
        &self,
        kind: EntityKind,
        changes: &[PendingChange],
        report: &mut SyncReport,
    ) -> Result<(), RemoteError> {
        let mut operations = Vec::with_capacity(changes.len());
        for change in changes {
            match self.reconcile_op_for(kind, change).await? {
                Some(op) => operations.push(op),
                None => {
                    if let Err(err) = self
                        .handle_mapping_skip(change, report)
                        .await
                    {
                        warn!(error = %err, "failed to requeue unmappable change");
                    }
                }
            }
        }
        if operations.is_empty() {
            return Ok(());
        }

        let outcomes = self.remote.reconcile(kind, &operations).await?;
        for outcome in outcomes {
            if outcome.success {
                match outcome.op {
                    ChangeOp::Delete => {}
                    ChangeOp::Create | ChangeOp::Update => {
                        let local_id = outcome.local_ref.parse::<i64>().ok();
                        match (local_id, outcome.data) {
                            (Some(local_id), Some(value)) => {
                                self.confirm(kind, local_id, &value).await;
                            }
                            _ => {
                                warn!(kind = %kind, local_ref = %outcome.local_ref, "reconcile outcome carried no record");
                            }
                        }
                    }
                }
                report.pushed.bump(kind);
            } else if outcome.is_version_conflict() {
                report.conflicts.push(Conflict {
                    kind,
                    remote_id: outcome.id,
                    message: outcome
                        .error
                        .map(|error| error.message)
                        .unwrap_or_else(|| "version conflict".to_string()),
                });
            } else {
                warn!(
                    kind = %kind,
                    local_ref = %outcome.local_ref,
                    error = ?outcome.error,
                    "remote rejected a reconcile operation"
                );
                report.rejected += 1;
            }
        }
        Ok(())
    }

    async fn reconcile_op_for(
        &self,
        kind: EntityKind,
        change: &PendingChange,
    ) -> Result<Option<ReconcileOp>, RemoteError> {
        let local_ref = change.local_id.to_string();
        match change.op {
            ChangeOp::Create => {
                let Some(record) = self.record_for(kind, change.local_id).await? else {
                    return Ok(None);
                };
                match self.mapper.to_wire(kind, &record.fields, 0).await {
                    Ok(wire) => Ok(Some(ReconcileOp {
                        op: ChangeOp::Create,
                        local_ref,
                        id: None,
                        version: None,
                        payload: Some(wire),
                    })),
                    Err(_) => Ok(None),
                }
            }
            ChangeOp::Update => {
                let Some(record) = self.record_for(kind, change.local_id).await? else {
                    return Ok(None);
                };
                let Some(remote_id) = record.remote_id.clone() else {
                    return Ok(None);
                };
                match self.mapper.to_wire(kind, &record.fields, record.version).await {
                    Ok(wire) => Ok(Some(ReconcileOp {
                        op: ChangeOp::Update,
                        local_ref,
                        id: Some(remote_id),
                        version: Some(record.version),
                        payload: Some(wire),
                    })),
                    Err(_) => Ok(None),
                }
            }
            ChangeOp::Delete => {
                let remote_id = change
                    .payload
                    .get("id")
                    .and_then(|id| id.as_str())
                    .map(str::to_string);
                let version = change.payload.get("version").and_then(|v| v.as_i64());
                match remote_id {
                    Some(id) => Ok(Some(ReconcileOp {
                        op: ChangeOp::Delete,
                        local_ref,
                        id: Some(id),
                        version,
                        payload: None,
                    })),
                    None => Ok(None),
                }
            }
        }
    }

    async fn pull_kind(
        &self,
        kind: EntityKind,
        report: &mut SyncReport,
    ) -> Result<(), CycleError> {
        let values = match self.remote.list(kind).await {
            Ok(values) => values,
            Err(err) => return Err(self.fail(err)),
        };

        let mut seen = HashSet::new();
        for value in &values {
            let pulled = match self.mapper.from_wire(kind, value).await {
                Ok(pulled) => pulled,
                Err(MappingError::UnknownPaper(paper_id)) => {
                    warn!(kind = %kind, paper_id = %paper_id, "skipping remote annotation for an unknown paper");
                    continue;
                }
                Err(err) => {
                    warn!(kind = %kind, error = %err, "skipping malformed remote record");
                    continue;
                }
            };
            seen.insert(pulled.remote_id.clone());

            let current = self.store.get_by_remote(kind, &pulled.remote_id).await?;
            let changed = match &current {
                Some(record) => record.version != pulled.version || record.fields != pulled.fields,
                None => true,
            };
            if changed {
                self.store
                    .apply_remote(kind, &pulled.remote_id, pulled.version, &pulled.fields)
                    .await?;
                report.pulled.bump(kind);
            }
        }

        // Anything synced locally but absent from the authoritative listing
        // was deleted remotely. Records that never synced are untouched.
        for record in self.store.list(kind).await? {
            if let Some(remote_id) = &record.remote_id {
                if !seen.contains(remote_id) {
                    self.store.delete(kind, record.local_id).await?;
                    report.deleted.bump(kind);
                }
            }
        }
        Ok(())
    }

    /// Records the identity and content the remote echoed for an accepted
    /// push. The remote already holds the record, so a failure here is
    /// logged and left for the next pull to repair; failing the cycle would
    /// requeue a change the remote accepted and duplicate it.
    async fn confirm(&self, kind: EntityKind, local_id: i64, value: &serde_json::Value) {
        let pulled = match self.mapper.from_wire(kind, value).await {
            Ok(pulled) => pulled,
            Err(err) => {
                warn!(kind = %kind, local_id, error = %err, "remote echoed a malformed record");
                return;
            }
        };
        if let Err(err) = self
            .store
            .confirm_push(kind, local_id, &pulled.remote_id, pulled.version, &pulled.fields)
            .await
        {
            warn!(kind = %kind, local_id, error = %err, "failed to mirror an accepted push locally");
        }
    }

    async fn record_for(
        &self,
        kind: EntityKind,
        local_id: i64,
    ) -> Result<Option<crate::store::StoredRecord>, RemoteError> {
        self.store
            .get(kind, local_id)
            .await
            .map_err(|err| RemoteError::Protocol(err.to_string()))
    }

    /// A change that cannot be mapped yet (e.g. an annotation whose paper has
    /// no remote identity) goes back on the queue for a later cycle.
    async fn handle_mapping_failure(
        &self,
        change: &PendingChange,
        err: MappingError,
        report: &mut SyncReport,
    ) -> Result<(), RemoteError> {
        match err {
            MappingError::UnsyncedPaper(paper_local_id) => {
                debug!(paper_local_id, "requeueing change until its paper syncs");
                self.tracker
                    .restore(change)
                    .await
                    .map_err(|err| RemoteError::Protocol(err.to_string()))?;
            }
            other => {
                warn!(error = %other, "dropping unmappable pending change");
                report.rejected += 1;
            }
        }
        Ok(())
    }

    async fn handle_mapping_skip(
        &self,
        change: &PendingChange,
        report: &mut SyncReport,
    ) -> Result<(), TrackerError> {
        // Same policy as the single-change path: an annotation waiting on its
        // paper is requeued, anything else unmappable is dropped.
        if change.kind == EntityKind::Annotation {
            self.tracker.restore(change).await
        } else {
            report.rejected += 1;
            Ok(())
        }
    }

    fn handle_push_failure(
        &self,
        kind: EntityKind,
        remote_id: Option<String>,
        err: RemoteError,
        report: &mut SyncReport,
    ) -> Result<(), RemoteError> {
        match err {
            RemoteError::VersionConflict { message } => {
                report.conflicts.push(Conflict {
                    kind,
                    remote_id,
                    message,
                });
                Ok(())
            }
            RemoteError::Rejected { status, message } => {
                warn!(kind = %kind, status, message = %message, "remote rejected a pushed change");
                report.rejected += 1;
                Ok(())
            }
            fatal => Err(fatal),
        }
    }

    async fn requeue<'a>(
        &self,
        changes: impl Iterator<Item = &'a PendingChange>,
    ) -> Result<(), TrackerError> {
        for change in changes {
            self.tracker.restore(change).await?;
        }
        Ok(())
    }

    fn fail(&self, err: RemoteError) -> CycleError {
        match err {
            RemoteError::RateLimited { retry_after } => {
                self.governor
                    .mark_limited(retry_after.map(Duration::from_secs));
                CycleError::RateLimited {
                    remaining_ms: self.governor.remaining_ms(),
                }
            }
            RemoteError::Unreachable(message) => {
                self.governor.mark_limited(None);
                CycleError::Unreachable(message)
            }
            RemoteError::SessionExpired => CycleError::SessionExpired,
            RemoteError::NotAuthenticated => CycleError::NotAuthenticated,
            other => {
                self.governor.mark_limited(None);
                CycleError::Unreachable(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialCache, Session};
    use serde_json::json;
    use shelfmark_api::{LibraryClient, SessionClient};
    use sqlx::SqlitePool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn orchestrator_against(uri: &str) -> (SyncOrchestrator, LibraryStore, ChangeTracker) {
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
        let remote = Arc::new(RemoteClient::new(api, credentials));
        let governor = Arc::new(RateGovernor::default());
        let orchestrator =
            SyncOrchestrator::new(store.clone(), tracker.clone(), remote, governor);
        (orchestrator, store, tracker)
    }

    fn empty_listing(kind: &str) -> Mock {
        let body = if kind == "papers" {
            json!({
                "success": true,
                "data": { "items": [], "total": 0, "limit": 100, "offset": 0 }
            })
        } else {
            json!({ "success": true, "data": [] })
        };
        Mock::given(method("GET"))
            .and(path(format!("/v1/{kind}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
    }

    #[tokio::test]
    async fn offline_create_gains_remote_identity() {
        let server = MockServer::start().await;
        let (orchestrator, store, tracker) = orchestrator_against(&server.uri()).await;

        let record = store
            .insert(
                EntityKind::Paper,
                &json!({"title": "Raft", "authors": ["Ongaro"], "reading_status": "New"}),
            )
            .await
            .unwrap();
        tracker
            .record_create(EntityKind::Paper, record.local_id, &record.fields)
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/papers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "id": "p-1",
                    "title": "Raft",
                    "authors": ["Ongaro"],
                    "status": "New",
                    "version": 1
                }
            })))
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
                        "title": "Raft",
                        "authors": ["Ongaro"],
                        "status": "New",
                        "version": 1
                    }],
                    "total": 1, "limit": 100, "offset": 0
                }
            })))
            .mount(&server)
            .await;
        empty_listing("collections").mount(&server).await;
        empty_listing("annotations").mount(&server).await;

        let report = orchestrator.run_cycle().await.unwrap();

        assert!(report.had_local_changes);
        assert_eq!(report.pushed.papers, 1);
        assert!(report.conflicts.is_empty());

        let synced = store
            .get(EntityKind::Paper, record.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(synced.remote_id.as_deref(), Some("p-1"));
        assert_eq!(synced.version, 1);
        assert_eq!(tracker.len(EntityKind::Paper).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_create_echo_does_not_requeue_the_change() {
        let server = MockServer::start().await;
        let (orchestrator, store, tracker) = orchestrator_against(&server.uri()).await;

        let record = store
            .insert(
                EntityKind::Paper,
                &json!({"title": "Chord", "authors": [], "reading_status": "New"}),
            )
            .await
            .unwrap();
        tracker
            .record_create(EntityKind::Paper, record.local_id, &record.fields)
            .await
            .unwrap();

        // the remote accepted the create but echoed a record without an id;
        // the local mirror cannot be updated, yet the change must not go
        // back on the queue or the next cycle would create a duplicate
        Mock::given(method("POST"))
            .and(path("/v1/papers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "title": "Chord", "version": 1 }
            })))
            .expect(1)
            .mount(&server)
            .await;
        empty_listing("papers").mount(&server).await;
        empty_listing("collections").mount(&server).await;
        empty_listing("annotations").mount(&server).await;

        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.pushed.papers, 1);
        assert_eq!(tracker.len(EntityKind::Paper).await.unwrap(), 0);
        // the record stays until the next pull repairs its identity
        assert!(store
            .get(EntityKind::Paper, record.local_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stale_update_loses_to_the_remote_copy() {
        let server = MockServer::start().await;
        let (orchestrator, store, tracker) = orchestrator_against(&server.uri()).await;

        let record = store
            .insert_with_remote(
                EntityKind::Paper,
                &json!({"title": "Local title", "authors": [], "reading_status": "Reading"}),
                Some("p-1"),
                3,
            )
            .await
            .unwrap();
        tracker
            .record_update(EntityKind::Paper, record.local_id, &json!({"title": "Local title"}))
            .await
            .unwrap();

        Mock::given(method("PUT"))
            .and(path("/v1/papers/p-1"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "success": false,
                "error": { "message": "remote is at version 4" }
            })))
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
                        "title": "Remote title",
                        "authors": [],
                        "status": "Read",
                        "version": 4
                    }],
                    "total": 1, "limit": 100, "offset": 0
                }
            })))
            .mount(&server)
            .await;
        empty_listing("collections").mount(&server).await;
        empty_listing("annotations").mount(&server).await;

        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].kind, EntityKind::Paper);

        let overwritten = store
            .get_by_remote(EntityKind::Paper, "p-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(overwritten.version, 4);
        assert_eq!(overwritten.fields["title"], "Remote title");
    }

    #[tokio::test]
    async fn unreachable_push_requeues_the_change() {
        let (orchestrator, store, tracker) = orchestrator_against("http://127.0.0.1:1").await;

        let record = store
            .insert(
                EntityKind::Collection,
                &json!({"name": "Consensus"}),
            )
            .await
            .unwrap();
        tracker
            .record_create(EntityKind::Collection, record.local_id, &record.fields)
            .await
            .unwrap();

        let err = orchestrator.run_cycle().await.unwrap_err();

        assert!(matches!(err, CycleError::Unreachable(_)));
        assert_eq!(tracker.len(EntityKind::Collection).await.unwrap(), 1);
        assert!(orchestrator.governor.is_limited());
    }

    #[tokio::test]
    async fn rate_limit_aborts_before_any_request() {
        let server = MockServer::start().await;
        let (orchestrator, _store, _tracker) = orchestrator_against(&server.uri()).await;

        orchestrator
            .governor
            .mark_limited(Some(Duration::from_secs(60)));

        let err = orchestrator.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::RateLimited { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_deletion_is_mirrored_locally() {
        let server = MockServer::start().await;
        let (orchestrator, store, _tracker) = orchestrator_against(&server.uri()).await;

        store
            .insert_with_remote(
                EntityKind::Collection,
                &json!({"name": "Gone upstream"}),
                Some("c-1"),
                2,
            )
            .await
            .unwrap();
        let local_only = store
            .insert(EntityKind::Collection, &json!({"name": "Never synced"}))
            .await
            .unwrap();

        empty_listing("papers").mount(&server).await;
        empty_listing("collections").mount(&server).await;
        empty_listing("annotations").mount(&server).await;

        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.deleted.collections, 1);
        assert!(store
            .get_by_remote(EntityKind::Collection, "c-1")
            .await
            .unwrap()
            .is_none());
        // a record that never synced is not the remote's to delete
        assert!(store
            .get(EntityKind::Collection, local_only.local_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn several_changes_go_through_one_reconcile_request() {
        let server = MockServer::start().await;
        let (orchestrator, store, tracker) = orchestrator_against(&server.uri()).await;

        let first = store
            .insert(EntityKind::Collection, &json!({"name": "Queues"}))
            .await
            .unwrap();
        let second = store
            .insert(EntityKind::Collection, &json!({"name": "Logs"}))
            .await
            .unwrap();
        tracker
            .record_create(EntityKind::Collection, first.local_id, &first.fields)
            .await
            .unwrap();
        tracker
            .record_create(EntityKind::Collection, second.local_id, &second.fields)
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/collections/reconcile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [
                    {
                        "localRef": first.local_id.to_string(),
                        "op": "create",
                        "success": true,
                        "id": "c-1",
                        "data": { "id": "c-1", "name": "Queues", "version": 1 }
                    },
                    {
                        "localRef": second.local_id.to_string(),
                        "op": "create",
                        "success": true,
                        "id": "c-2",
                        "data": { "id": "c-2", "name": "Logs", "version": 1 }
                    }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        empty_listing("papers").mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/collections"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [
                    { "id": "c-1", "name": "Queues", "version": 1 },
                    { "id": "c-2", "name": "Logs", "version": 1 }
                ]
            })))
            .mount(&server)
            .await;
        empty_listing("annotations").mount(&server).await;

        let report = orchestrator.run_cycle().await.unwrap();

        assert_eq!(report.pushed.collections, 2);
        assert_eq!(
            store
                .get(EntityKind::Collection, first.local_id)
                .await
                .unwrap()
                .unwrap()
                .remote_id
                .as_deref(),
            Some("c-1")
        );
        assert_eq!(
            store
                .get(EntityKind::Collection, second.local_id)
                .await
                .unwrap()
                .unwrap()
                .remote_id
                .as_deref(),
            Some("c-2")
        );
    }

    #[tokio::test]
    async fn clean_cycle_resets_the_governor() {
        let server = MockServer::start().await;
        let (orchestrator, _store, _tracker) = orchestrator_against(&server.uri()).await;

        empty_listing("papers").mount(&server).await;
        empty_listing("collections").mount(&server).await;
        empty_listing("annotations").mount(&server).await;

        orchestrator.governor.mark_limited(None);
        // let the computed deadline pass so the cycle is allowed to start
        tokio::time::sleep(Duration::from_millis(2100)).await;

        let report = orchestrator.run_cycle().await.unwrap();
        assert!(!report.had_local_changes);
        assert_eq!(orchestrator.governor.consecutive_failures(), 0);
    }
}
