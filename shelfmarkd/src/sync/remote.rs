use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use shelfmark_api::{ApiError, ApiErrorClass, EntityKind, LibraryClient, ReconcileOp, ReconcileOutcome};

use crate::credentials::{CredentialCache, RenewError};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote service unreachable: {0}")]
    Unreachable(String),
    #[error("rate limited by remote service")]
    RateLimited { retry_after: Option<u64> },
    #[error("session expired, re-authentication required")]
    SessionExpired,
    #[error("version conflict: {message}")]
    VersionConflict { message: String },
    #[error("remote rejected request with {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no credential is available")]
    NotAuthenticated,
}

enum Request<'a> {
    Create {
        kind: EntityKind,
        payload: &'a Value,
    },
    Update {
        kind: EntityKind,
        id: &'a str,
        payload: &'a Value,
    },
    Delete {
        kind: EntityKind,
        id: &'a str,
    },
    List {
        kind: EntityKind,
    },
    Reconcile {
        kind: EntityKind,
        operations: &'a [ReconcileOp],
    },
}

enum Reply {
    Record(Value),
    Records(Vec<Value>),
    Outcomes(Vec<ReconcileOutcome>),
    Empty,
}

/// Remote operations with the credential lifecycle folded in: every call
/// attaches the cached credential, renews once on an auth-expired response
/// and retries the same request once, and maps remaining failures into the
/// sync error taxonomy.
pub struct RemoteClient {
    api: LibraryClient,
    credentials: Arc<CredentialCache>,
}

impl RemoteClient {
    pub fn new(api: LibraryClient, credentials: Arc<CredentialCache>) -> Self {
        Self { api, credentials }
    }

    pub async fn create(&self, kind: EntityKind, payload: &Value) -> Result<Value, RemoteError> {
        match self.execute(Request::Create { kind, payload }).await? {
            Reply::Record(value) => Ok(value),
            _ => Err(RemoteError::Protocol("expected a single record".into())),
        }
    }

    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<Value, RemoteError> {
        match self.execute(Request::Update { kind, id, payload }).await? {
            Reply::Record(value) => Ok(value),
            _ => Err(RemoteError::Protocol("expected a single record".into())),
        }
    }

    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.execute(Request::Delete { kind, id }).await?;
        Ok(())
    }

    pub async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, RemoteError> {
        match self.execute(Request::List { kind }).await? {
            Reply::Records(values) => Ok(values),
            _ => Err(RemoteError::Protocol("expected a record listing".into())),
        }
    }

    pub async fn reconcile(
        &self,
        kind: EntityKind,
        operations: &[ReconcileOp],
    ) -> Result<Vec<ReconcileOutcome>, RemoteError> {
        match self.execute(Request::Reconcile { kind, operations }).await? {
            Reply::Outcomes(outcomes) => Ok(outcomes),
            _ => Err(RemoteError::Protocol("expected reconcile outcomes".into())),
        }
    }

    /// Unauthenticated reachability probe.
    pub async fn ping(&self) -> bool {
        self.api.ping().await.is_ok()
    }

    async fn execute(&self, request: Request<'_>) -> Result<Reply, RemoteError> {
        let token = self
            .credentials
            .current()
            .await
            .ok_or(RemoteError::NotAuthenticated)?;
        match self.dispatch(&token, &request).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.classification() == Some(ApiErrorClass::Auth) => {
                debug!("remote call unauthorized, renewing credential once");
                let renewed = match self.credentials.renew().await {
                    Ok(token) => token,
                    Err(RenewError::Unreachable(message)) => {
                        return Err(RemoteError::Unreachable(message));
                    }
                    Err(RenewError::AuthExpired(_)) | Err(RenewError::NotAuthenticated) => {
                        self.credentials.clear().await;
                        return Err(RemoteError::SessionExpired);
                    }
                };
                match self.dispatch(&renewed, &request).await {
                    Ok(reply) => Ok(reply),
                    Err(err) if err.classification() == Some(ApiErrorClass::Auth) => {
                        self.credentials.clear().await;
                        Err(RemoteError::SessionExpired)
                    }
                    Err(err) => Err(map_api_error(err)),
                }
            }
            Err(err) => Err(map_api_error(err)),
        }
    }

    async fn dispatch(&self, token: &str, request: &Request<'_>) -> Result<Reply, ApiError> {
        match request {
            Request::Create { kind, payload } => self
                .api
                .create(token, *kind, payload)
                .await
                .map(Reply::Record),
            Request::Update { kind, id, payload } => self
                .api
                .update(token, *kind, id, payload)
                .await
                .map(Reply::Record),
            Request::Delete { kind, id } => {
                self.api.delete(token, *kind, id).await.map(|_| Reply::Empty)
            }
            Request::List { kind } => self.api.list_all(token, *kind).await.map(Reply::Records),
            Request::Reconcile { kind, operations } => self
                .api
                .reconcile(token, *kind, operations)
                .await
                .map(Reply::Outcomes),
        }
    }
}

fn map_api_error(err: ApiError) -> RemoteError {
    if err.is_unreachable() {
        return RemoteError::Unreachable(err.to_string());
    }
    match err.classification() {
        Some(ApiErrorClass::RateLimit) => RemoteError::RateLimited {
            retry_after: err.retry_after_secs(),
        },
        Some(ApiErrorClass::VersionConflict) => RemoteError::VersionConflict {
            message: err.to_string(),
        },
        _ => match err {
            ApiError::Api {
                status, message, ..
            } => RemoteError::Rejected {
                status: status.as_u16(),
                message,
            },
            other => RemoteError::Protocol(other.to_string()),
        },
    }
}
