use serde_json::Value;
use thiserror::Error;

use shelfmark_api::{AnnotationRecord, CollectionRecord, EntityKind, PaperRecord};

use crate::models::{Annotation, Collection, Paper, ReadingStatus};
use crate::store::{LibraryStore, StoreError};

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed fields payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("remote record is missing its id")]
    MissingRemoteId,
    #[error("unknown reading status: {0}")]
    UnknownStatus(String),
    #[error("paper {0} has no remote identity yet")]
    UnsyncedPaper(i64),
    #[error("no local paper for remote id {0}")]
    UnknownPaper(String),
}

/// Authoritative remote state of one record, reshaped for the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledRecord {
    pub remote_id: String,
    pub version: i64,
    pub fields: Value,
}

/// Translates between the local fields payload and the remote wire shape.
/// The two disagree on naming (`reading_status` vs `status`, `file_key` vs
/// `attachmentKey`, `highlight_color` vs `color`) and on how annotations
/// reference their paper: locally by row id, remotely by the paper's remote
/// id, so annotation mapping goes through the store.
#[derive(Clone)]
pub struct WireMapper {
    store: LibraryStore,
}

impl WireMapper {
    pub fn new(store: LibraryStore) -> Self {
        Self { store }
    }

    /// Local fields payload to remote request body. `version` is the version
    /// last seen from the remote service, sent back for conflict detection.
    pub async fn to_wire(
        &self,
        kind: EntityKind,
        fields: &Value,
        version: i64,
    ) -> Result<Value, MappingError> {
        match kind {
            EntityKind::Paper => {
                let paper: Paper = serde_json::from_value(fields.clone())?;
                Ok(serde_json::to_value(PaperRecord {
                    id: None,
                    title: paper.title,
                    authors: paper.authors,
                    status: paper.reading_status.as_str().to_string(),
                    attachment_key: paper.file_key,
                    version,
                })?)
            }
            EntityKind::Collection => {
                let collection: Collection = serde_json::from_value(fields.clone())?;
                Ok(serde_json::to_value(CollectionRecord {
                    id: None,
                    name: collection.name,
                    description: collection.description,
                    version,
                })?)
            }
            EntityKind::Annotation => {
                let annotation: Annotation = serde_json::from_value(fields.clone())?;
                let paper = self
                    .store
                    .get(EntityKind::Paper, annotation.paper_local_id)
                    .await?
                    .ok_or(MappingError::UnsyncedPaper(annotation.paper_local_id))?;
                let paper_id = paper
                    .remote_id
                    .ok_or(MappingError::UnsyncedPaper(annotation.paper_local_id))?;
                Ok(serde_json::to_value(AnnotationRecord {
                    id: None,
                    paper_id,
                    page: annotation.page,
                    quote: annotation.quote,
                    note: annotation.note,
                    color: annotation.highlight_color,
                    version,
                })?)
            }
        }
    }

    /// Remote record to local fields payload plus its remote identity.
    pub async fn from_wire(
        &self,
        kind: EntityKind,
        value: &Value,
    ) -> Result<PulledRecord, MappingError> {
        match kind {
            EntityKind::Paper => {
                let record: PaperRecord = serde_json::from_value(value.clone())?;
                let remote_id = record.id.ok_or(MappingError::MissingRemoteId)?;
                let reading_status = ReadingStatus::parse(&record.status)
                    .map_err(|err| MappingError::UnknownStatus(err.0))?;
                let paper = Paper {
                    local_id: 0,
                    remote_id: None,
                    version: 0,
                    created_at: 0,
                    updated_at: 0,
                    title: record.title,
                    authors: record.authors,
                    reading_status,
                    file_key: record.attachment_key,
                    file_upload_pending: false,
                };
                Ok(PulledRecord {
                    remote_id,
                    version: record.version,
                    fields: serde_json::to_value(&paper)?,
                })
            }
            EntityKind::Collection => {
                let record: CollectionRecord = serde_json::from_value(value.clone())?;
                let remote_id = record.id.ok_or(MappingError::MissingRemoteId)?;
                let collection = Collection {
                    local_id: 0,
                    remote_id: None,
                    version: 0,
                    created_at: 0,
                    updated_at: 0,
                    name: record.name,
                    description: record.description,
                };
                Ok(PulledRecord {
                    remote_id,
                    version: record.version,
                    fields: serde_json::to_value(&collection)?,
                })
            }
            EntityKind::Annotation => {
                let record: AnnotationRecord = serde_json::from_value(value.clone())?;
                let remote_id = record.id.ok_or(MappingError::MissingRemoteId)?;
                let paper = self
                    .store
                    .get_by_remote(EntityKind::Paper, &record.paper_id)
                    .await?
                    .ok_or_else(|| MappingError::UnknownPaper(record.paper_id.clone()))?;
                let annotation = Annotation {
                    local_id: 0,
                    remote_id: None,
                    version: 0,
                    created_at: 0,
                    updated_at: 0,
                    paper_local_id: paper.local_id,
                    page: record.page,
                    quote: record.quote,
                    note: record.note,
                    highlight_color: record.color,
                };
                Ok(PulledRecord {
                    remote_id,
                    version: record.version,
                    fields: serde_json::to_value(&annotation)?,
                })
            }
        }
    }
}
