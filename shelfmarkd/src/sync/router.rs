use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use shelfmark_api::EntityKind;

use crate::credentials::CredentialCache;
use crate::models::{
    Annotation, AnnotationPatch, Collection, CollectionPatch, NewAnnotation, NewCollection,
    NewPaper, Paper, PaperPatch, merge_fields,
};
use crate::store::{LibraryStore, StoreError, StoredRecord};
use crate::sync::governor::RateGovernor;
use crate::sync::mapping::WireMapper;
use crate::sync::remote::RemoteClient;
use crate::sync::tracker::{ChangeTracker, TrackerError};
use crate::sync::triggers::SyncHandle;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("change queue error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("no such record")]
    MissingRecord,
}

/// Runtime toggle for cloud sync, flipped without restarting the daemon.
pub struct SyncSettings {
    enabled: AtomicBool,
}

impl SyncSettings {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Snapshot of whether sync may be attempted right now. Computed once per
/// routing operation and never cached beyond it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncAvailability {
    pub enabled: bool,
    pub authenticated: bool,
    pub rate_limited: bool,
}

impl SyncAvailability {
    pub fn usable(&self) -> bool {
        self.enabled && self.authenticated && !self.rate_limited
    }
}

/// Front door for every library mutation. Writes go remote-first while sync
/// is usable, with the store mirroring the remote result; otherwise they
/// land in the store plus the pending change queue, to be replayed by the
/// next cycle. Reads always come from the store.
pub struct RoutingAdapter {
    store: LibraryStore,
    tracker: ChangeTracker,
    remote: Arc<RemoteClient>,
    mapper: WireMapper,
    governor: Arc<RateGovernor>,
    settings: Arc<SyncSettings>,
    credentials: Arc<CredentialCache>,
    scheduler: SyncHandle,
}

impl RoutingAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: LibraryStore,
        tracker: ChangeTracker,
        remote: Arc<RemoteClient>,
        governor: Arc<RateGovernor>,
        settings: Arc<SyncSettings>,
        credentials: Arc<CredentialCache>,
        scheduler: SyncHandle,
    ) -> Self {
        let mapper = WireMapper::new(store.clone());
        Self {
            store,
            tracker,
            remote,
            mapper,
            governor,
            settings,
            credentials,
            scheduler,
        }
    }

    pub async fn availability(&self) -> SyncAvailability {
        SyncAvailability {
            enabled: self.settings.is_enabled(),
            authenticated: self.credentials.is_authenticated().await,
            rate_limited: self.governor.is_limited(),
        }
    }

    pub async fn add_paper(&self, paper: &NewPaper) -> Result<Paper, RouterError> {
        let record = self
            .add_record(EntityKind::Paper, &serde_json::to_value(paper)?)
            .await?;
        Ok(record.decode()?)
    }

    pub async fn update_paper(
        &self,
        local_id: i64,
        patch: &PaperPatch,
    ) -> Result<Paper, RouterError> {
        let record = self
            .update_record(EntityKind::Paper, local_id, &serde_json::to_value(patch)?)
            .await?;
        Ok(record.decode()?)
    }

    pub async fn delete_paper(&self, local_id: i64) -> Result<(), RouterError> {
        self.delete_record(EntityKind::Paper, local_id).await
    }

    pub async fn get_paper(&self, local_id: i64) -> Result<Option<Paper>, RouterError> {
        self.get_decoded(EntityKind::Paper, local_id).await
    }

    pub async fn list_papers(&self) -> Result<Vec<Paper>, RouterError> {
        self.list_decoded(EntityKind::Paper).await
    }

    pub async fn add_collection(&self, collection: &NewCollection) -> Result<Collection, RouterError> {
        let record = self
            .add_record(EntityKind::Collection, &serde_json::to_value(collection)?)
            .await?;
        Ok(record.decode()?)
    }

    pub async fn update_collection(
        &self,
        local_id: i64,
        patch: &CollectionPatch,
    ) -> Result<Collection, RouterError> {
        let record = self
            .update_record(EntityKind::Collection, local_id, &serde_json::to_value(patch)?)
            .await?;
        Ok(record.decode()?)
    }

    pub async fn delete_collection(&self, local_id: i64) -> Result<(), RouterError> {
        self.delete_record(EntityKind::Collection, local_id).await
    }

    pub async fn list_collections(&self) -> Result<Vec<Collection>, RouterError> {
        self.list_decoded(EntityKind::Collection).await
    }

    pub async fn add_annotation(&self, annotation: &NewAnnotation) -> Result<Annotation, RouterError> {
        let record = self
            .add_record(EntityKind::Annotation, &serde_json::to_value(annotation)?)
            .await?;
        Ok(record.decode()?)
    }

    pub async fn update_annotation(
        &self,
        local_id: i64,
        patch: &AnnotationPatch,
    ) -> Result<Annotation, RouterError> {
        let record = self
            .update_record(EntityKind::Annotation, local_id, &serde_json::to_value(patch)?)
            .await?;
        Ok(record.decode()?)
    }

    pub async fn delete_annotation(&self, local_id: i64) -> Result<(), RouterError> {
        self.delete_record(EntityKind::Annotation, local_id).await
    }

    pub async fn list_annotations(&self) -> Result<Vec<Annotation>, RouterError> {
        self.list_decoded(EntityKind::Annotation).await
    }

    async fn add_record(&self, kind: EntityKind, fields: &Value) -> Result<StoredRecord, RouterError> {
        if self.availability().await.usable() {
            if let Some(record) = self.try_remote_add(kind, fields).await {
                self.scheduler.schedule_debounced();
                return Ok(record);
            }
        }

        let record = self.store.insert(kind, fields).await?;
        self.tracker
            .record_create(kind, record.local_id, &record.fields)
            .await?;
        self.scheduler.schedule_debounced();
        Ok(record)
    }

    async fn try_remote_add(&self, kind: EntityKind, fields: &Value) -> Option<StoredRecord> {
        let wire = match self.mapper.to_wire(kind, fields, 0).await {
            Ok(wire) => wire,
            Err(err) => {
                debug!(kind = %kind, error = %err, "cannot map new record for upload yet");
                return None;
            }
        };
        let value = match self.remote.create(kind, &wire).await {
            Ok(value) => value,
            Err(err) => {
                debug!(kind = %kind, error = %err, "remote create failed, writing locally");
                return None;
            }
        };
        let pulled = match self.mapper.from_wire(kind, &value).await {
            Ok(pulled) => pulled,
            Err(err) => {
                warn!(kind = %kind, error = %err, "remote accepted the record but echoed it malformed");
                return None;
            }
        };
        match self
            .store
            .insert_with_remote(kind, &pulled.fields, Some(&pulled.remote_id), pulled.version)
            .await
        {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(kind = %kind, error = %err, "failed to mirror remote record locally");
                None
            }
        }
    }

    async fn update_record(
        &self,
        kind: EntityKind,
        local_id: i64,
        patch: &Value,
    ) -> Result<StoredRecord, RouterError> {
        let record = self
            .store
            .get(kind, local_id)
            .await?
            .ok_or(RouterError::MissingRecord)?;

        if self.availability().await.usable() {
            if let Some(remote_id) = record.remote_id.clone() {
                if self
                    .try_remote_update(kind, &record, &remote_id, patch)
                    .await
                {
                    self.scheduler.schedule_debounced();
                    return self
                        .store
                        .get(kind, local_id)
                        .await?
                        .ok_or(RouterError::MissingRecord);
                }
            }
        }

        let updated = self.store.apply_patch(kind, local_id, patch).await?;
        self.tracker.record_update(kind, local_id, patch).await?;
        self.scheduler.schedule_debounced();
        Ok(updated)
    }

    async fn try_remote_update(
        &self,
        kind: EntityKind,
        record: &StoredRecord,
        remote_id: &str,
        patch: &Value,
    ) -> bool {
        let mut fields = record.fields.clone();
        merge_fields(&mut fields, patch);
        let wire = match self.mapper.to_wire(kind, &fields, record.version).await {
            Ok(wire) => wire,
            Err(err) => {
                debug!(kind = %kind, error = %err, "cannot map update for upload");
                return false;
            }
        };
        let value = match self.remote.update(kind, remote_id, &wire).await {
            Ok(value) => value,
            Err(err) => {
                debug!(kind = %kind, error = %err, "remote update failed, writing locally");
                return false;
            }
        };
        match self.mapper.from_wire(kind, &value).await {
            Ok(pulled) => {
                // remote is authoritative; a mirror failure only costs us the
                // echoed copy until the next cycle pulls it again
                if let Err(err) = self
                    .store
                    .confirm_push(kind, record.local_id, &pulled.remote_id, pulled.version, &pulled.fields)
                    .await
                {
                    warn!(kind = %kind, error = %err, "failed to mirror remote update locally");
                }
                true
            }
            Err(err) => {
                warn!(kind = %kind, error = %err, "remote accepted the update but echoed it malformed");
                true
            }
        }
    }

    async fn delete_record(&self, kind: EntityKind, local_id: i64) -> Result<(), RouterError> {
        let record = self
            .store
            .get(kind, local_id)
            .await?
            .ok_or(RouterError::MissingRecord)?;

        if self.availability().await.usable() {
            if let Some(remote_id) = &record.remote_id {
                match self.remote.delete(kind, remote_id).await {
                    Ok(()) => {
                        if let Err(err) = self.store.delete(kind, local_id).await {
                            warn!(kind = %kind, error = %err, "failed to mirror remote delete locally");
                        }
                        self.scheduler.schedule_debounced();
                        return Ok(());
                    }
                    Err(err) => {
                        debug!(kind = %kind, error = %err, "remote delete failed, deleting locally");
                    }
                }
            }
        }

        let payload = record
            .remote_id
            .as_ref()
            .map(|id| json!({ "id": id, "version": record.version }));
        self.store.delete(kind, local_id).await?;
        self.tracker
            .record_delete(kind, local_id, payload.as_ref())
            .await?;
        self.scheduler.schedule_debounced();
        Ok(())
    }

    async fn get_decoded<T: crate::models::Entity>(
        &self,
        kind: EntityKind,
        local_id: i64,
    ) -> Result<Option<T>, RouterError> {
        match self.store.get(kind, local_id).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    /// Listing is the natural moment to freshen: schedule a debounced sync
    /// and serve the store immediately.
    async fn list_decoded<T: crate::models::Entity>(
        &self,
        kind: EntityKind,
    ) -> Result<Vec<T>, RouterError> {
        self.scheduler.schedule_debounced();
        self.store
            .list(kind)
            .await?
            .iter()
            .map(|record| record.decode().map_err(RouterError::from))
            .collect()
    }
}
