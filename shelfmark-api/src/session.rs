use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.shelfmark.app";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("renewal rejected with {status}: {message}")]
    Rejected { status: StatusCode, message: String },
}

impl SessionError {
    /// True when the service itself refused the renewal (the credential is
    /// gone for good), as opposed to a transport failure or a server error
    /// worth retrying later.
    pub fn is_rejection(&self) -> bool {
        match self {
            SessionError::Rejected { status, .. } => !status.is_server_error(),
            _ => false,
        }
    }
}

/// Renews access credentials against the auth endpoint.
#[derive(Clone)]
pub struct SessionClient {
    http: Client,
    base_url: Url,
}

impl SessionClient {
    pub fn new() -> Result<Self, SessionError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, SessionError> {
        Ok(Self {
            http: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            base_url: Url::parse(base_url)?,
        })
    }

    pub async fn renew(&self, refresh_token: &str) -> Result<SessionToken, SessionError> {
        let url = self.base_url.join("/v1/auth/renew")?;
        let response = self
            .http
            .post(url)
            .json(&RenewRequest { refresh_token })
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let message = serde_json::from_str::<RenewEnvelope>(&body)
                .ok()
                .and_then(|envelope| envelope.error)
                .map(|error| error.message)
                .unwrap_or(body);
            return Err(SessionError::Rejected { status, message });
        }
        let envelope: RenewEnvelope =
            serde_json::from_str(&body).map_err(|_| SessionError::Rejected {
                status,
                message: "malformed renewal envelope".to_string(),
            })?;
        match (envelope.success, envelope.data) {
            (true, Some(token)) => Ok(token),
            _ => Err(SessionError::Rejected {
                status,
                message: envelope
                    .error
                    .map(|error| error.message)
                    .unwrap_or_else(|| "renewal was not successful".to_string()),
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RenewEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<SessionToken>,
    #[serde(default)]
    error: Option<RenewErrorBody>,
}

#[derive(Deserialize)]
struct RenewErrorBody {
    message: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}
