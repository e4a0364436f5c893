use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use shelfmark_api::{ChangeOp, EntityKind};

pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Merges the top-level keys of `patch` into `base`. Both are expected to be
/// JSON objects; a non-object patch replaces `base` wholesale.
pub fn merge_fields(base: &mut Value, patch: &Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base_map), Some(patch_map)) => {
            for (key, value) in patch_map {
                base_map.insert(key.clone(), value.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}

#[derive(Debug, Error)]
#[error("unknown reading status: {0}")]
pub struct UnknownReadingStatus(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingStatus {
    New,
    Reading,
    Read,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::New => "New",
            ReadingStatus::Reading => "Reading",
            ReadingStatus::Read => "Read",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownReadingStatus> {
        match value {
            "New" => Ok(ReadingStatus::New),
            "Reading" => Ok(ReadingStatus::Reading),
            "Read" => Ok(ReadingStatus::Read),
            other => Err(UnknownReadingStatus(other.to_string())),
        }
    }
}

/// Sync bookkeeping shared by every stored entity. These fields live in
/// dedicated columns, never inside the JSON fields payload, and never go
/// over the wire.
pub trait Entity: Serialize + serde::de::DeserializeOwned {
    const KIND: EntityKind;

    fn attach_meta(
        &mut self,
        local_id: i64,
        remote_id: Option<String>,
        version: i64,
        created_at: i64,
        updated_at: i64,
    );
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Paper {
    #[serde(skip)]
    pub local_id: i64,
    #[serde(skip)]
    pub remote_id: Option<String>,
    #[serde(skip)]
    pub version: i64,
    #[serde(skip)]
    pub created_at: i64,
    #[serde(skip)]
    pub updated_at: i64,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub reading_status: ReadingStatus,
    #[serde(default)]
    pub file_key: Option<String>,
    #[serde(default)]
    pub file_upload_pending: bool,
}

impl Entity for Paper {
    const KIND: EntityKind = EntityKind::Paper;

    fn attach_meta(
        &mut self,
        local_id: i64,
        remote_id: Option<String>,
        version: i64,
        created_at: i64,
        updated_at: i64,
    ) {
        self.local_id = local_id;
        self.remote_id = remote_id;
        self.version = version;
        self.created_at = created_at;
        self.updated_at = updated_at;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collection {
    #[serde(skip)]
    pub local_id: i64,
    #[serde(skip)]
    pub remote_id: Option<String>,
    #[serde(skip)]
    pub version: i64,
    #[serde(skip)]
    pub created_at: i64,
    #[serde(skip)]
    pub updated_at: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Entity for Collection {
    const KIND: EntityKind = EntityKind::Collection;

    fn attach_meta(
        &mut self,
        local_id: i64,
        remote_id: Option<String>,
        version: i64,
        created_at: i64,
        updated_at: i64,
    ) {
        self.local_id = local_id;
        self.remote_id = remote_id;
        self.version = version;
        self.created_at = created_at;
        self.updated_at = updated_at;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    #[serde(skip)]
    pub local_id: i64,
    #[serde(skip)]
    pub remote_id: Option<String>,
    #[serde(skip)]
    pub version: i64,
    #[serde(skip)]
    pub created_at: i64,
    #[serde(skip)]
    pub updated_at: i64,
    pub paper_local_id: i64,
    pub page: i64,
    #[serde(default)]
    pub quote: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub highlight_color: String,
}

impl Entity for Annotation {
    const KIND: EntityKind = EntityKind::Annotation;

    fn attach_meta(
        &mut self,
        local_id: i64,
        remote_id: Option<String>,
        version: i64,
        created_at: i64,
        updated_at: i64,
    ) {
        self.local_id = local_id;
        self.remote_id = remote_id;
        self.version = version;
        self.created_at = created_at;
        self.updated_at = updated_at;
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewPaper {
    pub title: String,
    pub authors: Vec<String>,
    pub reading_status: ReadingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    pub file_upload_pending: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewCollection {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewAnnotation {
    pub paper_local_id: i64,
    pub page: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub highlight_color: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PaperPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_status: Option<ReadingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_upload_pending: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CollectionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AnnotationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight_color: Option<String>,
}
