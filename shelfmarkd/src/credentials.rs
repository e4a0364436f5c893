use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use shelfmark_api::SessionClient;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenewError {
    #[error("no session is installed")]
    NotAuthenticated,
    #[error("session renewal rejected: {0}")]
    AuthExpired(String),
    #[error("renewal service unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
}

type RenewFuture = Shared<BoxFuture<'static, Result<Session, RenewError>>>;

/// Holds the current access credential and serializes renewal: concurrent
/// `renew` calls all await the same in-flight renewal, so at most one
/// renewal request is ever on the wire. Runtime-only; nothing here survives
/// a restart.
pub struct CredentialCache {
    client: SessionClient,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    inflight: Option<RenewFuture>,
}

impl CredentialCache {
    pub fn new(client: SessionClient) -> Self {
        Self {
            client,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn with_session(client: SessionClient, session: Session) -> Self {
        Self {
            client,
            inner: Arc::new(Mutex::new(Inner {
                session: Some(session),
                inflight: None,
            })),
        }
    }

    pub async fn install(&self, session: Session) {
        self.inner.lock().await.session = Some(session);
    }

    /// The current access credential, if any.
    pub async fn current(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.lock().await.session.is_some()
    }

    /// Drops all credential state, e.g. after the remote service declared
    /// the session expired.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.session = None;
    }

    pub async fn renew(&self) -> Result<String, RenewError> {
        let future = {
            let mut inner = self.inner.lock().await;
            if let Some(inflight) = &inner.inflight {
                debug!("joining in-flight credential renewal");
                inflight.clone()
            } else {
                let refresh_token = inner
                    .session
                    .as_ref()
                    .map(|session| session.refresh_token.clone())
                    .ok_or(RenewError::NotAuthenticated)?;
                let client = self.client.clone();
                let state = Arc::clone(&self.inner);
                // The future settles and clears its own slot, so the next
                // renew starts fresh even when every original caller has
                // given up on awaiting it.
                let future = async move {
                    let result = match client.renew(&refresh_token).await {
                        Ok(token) => Ok(Session {
                            access_token: token.access_token,
                            refresh_token: token.refresh_token.unwrap_or(refresh_token),
                        }),
                        Err(err) if err.is_rejection() => {
                            Err(RenewError::AuthExpired(err.to_string()))
                        }
                        Err(err) => Err(RenewError::Unreachable(err.to_string())),
                    };
                    let mut inner = state.lock().await;
                    inner.inflight = None;
                    match &result {
                        Ok(session) => inner.session = Some(session.clone()),
                        Err(RenewError::AuthExpired(_)) => inner.session = None,
                        Err(_) => {}
                    }
                    result
                }
                .boxed()
                .shared();
                inner.inflight = Some(future.clone());
                future
            }
        };

        future.await.map(|session| session.access_token)
    }
}
