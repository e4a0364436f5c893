use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.shelfmark.app";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PAPER_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {message}")]
    Api {
        status: StatusCode,
        message: String,
        retry_after: Option<u64>,
    },
    #[error("api envelope carried no data")]
    MissingData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    VersionConflict,
    Transient,
    Permanent,
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Seconds the server asked us to wait, from a 429 `retry-after` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        match self {
            ApiError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::CONFLICT {
        ApiErrorClass::VersionConflict
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// One of the three record families the library keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Paper,
    Collection,
    Annotation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Paper,
        EntityKind::Collection,
        EntityKind::Annotation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Paper => "papers",
            EntityKind::Collection => "collections",
            EntityKind::Annotation => "annotations",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "papers" => Some(EntityKind::Paper),
            "collections" => Some(EntityKind::Collection),
            "annotations" => Some(EntityKind::Annotation),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct LibraryClient {
    http: Client,
    base_url: Url,
}

impl LibraryClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            base_url: Url::parse(base_url)?,
        })
    }

    pub async fn create(
        &self,
        token: &str,
        kind: EntityKind,
        payload: &Value,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(&format!("/v1/{}", kind.as_str()))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update(
        &self,
        token: &str,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(&format!("/v1/{}/{id}", kind.as_str()))?;
        let response = self
            .http
            .put(url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete(&self, token: &str, kind: EntityKind, id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("/v1/{}/{id}", kind.as_str()))?;
        let response = self.http.delete(url).bearer_auth(token).send().await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        Self::handle_response::<Value>(response).await?;
        Ok(())
    }

    pub async fn get(&self, token: &str, kind: EntityKind, id: &str) -> Result<Value, ApiError> {
        let url = self.endpoint(&format!("/v1/{}/{id}", kind.as_str()))?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Self::handle_response(response).await
    }

    /// One page of the paper listing. Only papers are paginated; other kinds
    /// come back as a plain array from [`LibraryClient::list_all`].
    pub async fn list_page(
        &self,
        token: &str,
        kind: EntityKind,
        limit: u32,
        offset: u32,
    ) -> Result<RecordPage, ApiError> {
        let mut url = self.endpoint(&format!("/v1/{}", kind.as_str()))?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let response = self.http.get(url).bearer_auth(token).send().await?;
        Self::handle_response(response).await
    }

    pub async fn list_all(&self, token: &str, kind: EntityKind) -> Result<Vec<Value>, ApiError> {
        if kind != EntityKind::Paper {
            let url = self.endpoint(&format!("/v1/{}", kind.as_str()))?;
            let response = self.http.get(url).bearer_auth(token).send().await?;
            return Self::handle_response(response).await;
        }

        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_page(token, kind, PAPER_PAGE_SIZE, offset)
                .await?;
            // an empty page ends the walk even if `total` claims otherwise,
            // so a lying server cannot keep us requesting forever
            if page.items.is_empty() {
                break;
            }
            offset = offset.saturating_add(page.items.len() as u32);
            let total = page.total;
            items.extend(page.items);
            if offset >= total {
                break;
            }
        }
        Ok(items)
    }

    /// Pushes a batch of pending operations in one request and returns the
    /// per-operation outcomes so the caller can apply only the successes.
    pub async fn reconcile(
        &self,
        token: &str,
        kind: EntityKind,
        operations: &[ReconcileOp],
    ) -> Result<Vec<ReconcileOutcome>, ApiError> {
        let url = self.endpoint(&format!("/v1/{}/reconcile", kind.as_str()))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&ReconcileRequest { operations })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn ping(&self) -> Result<(), ApiError> {
        let url = self.endpoint("/v1/health")?;
        let response = self.http.get(url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            Err(ApiError::Api {
                status,
                message: response.text().await.unwrap_or_default(),
                retry_after: None,
            })
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let message = serde_json::from_str::<Envelope<Value>>(&body)
                .ok()
                .and_then(|envelope| envelope.error)
                .map(|error| error.message)
                .unwrap_or(body);
            return Err(ApiError::Api {
                status,
                message,
                retry_after,
            });
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|_| ApiError::Api {
            status,
            message: "malformed response envelope".to_string(),
            retry_after: None,
        })?;
        if !envelope.success {
            return Err(ApiError::Api {
                status,
                message: envelope
                    .error
                    .map(|error| error.message)
                    .unwrap_or_else(|| "request was not successful".to_string()),
                retry_after,
            });
        }
        envelope.data.ok_or(ApiError::MissingData)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default = "Option::default")]
    data: Option<T>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RecordPage {
    pub items: Vec<Value>,
    pub total: u32,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

#[derive(Serialize)]
struct ReconcileRequest<'a> {
    operations: &'a [ReconcileOp],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOp {
    pub op: ChangeOp,
    /// Client-chosen handle echoed back in the outcome; the remote service
    /// never stores it.
    pub local_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub local_ref: String,
    pub op: ChangeOp,
    pub success: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<ReconcileErrorBody>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReconcileErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

impl ReconcileOutcome {
    pub fn is_version_conflict(&self) -> bool {
        self.error
            .as_ref()
            .and_then(|error| error.code.as_deref())
            .is_some_and(|code| code == "version_conflict")
    }
}

/// Wire shape of a paper. The remote contract names differ from the local
/// store: `status` (local `reading_status`), `attachmentKey` (local
/// `file_key`); local bookkeeping fields are never part of this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaperRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_key: Option<String>,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub paper_id: String,
    pub page: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub color: String,
    #[serde(default)]
    pub version: i64,
}
