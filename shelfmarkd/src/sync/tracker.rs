use serde_json::Value;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

use crate::models::{ChangeOp, EntityKind, merge_fields, now_unix};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pending_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        local_id INTEGER NOT NULL,
        op TEXT NOT NULL,
        payload TEXT NOT NULL,
        queued_at INTEGER NOT NULL,
        UNIQUE(kind, local_id)
    );
";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid entity kind: {0}")]
    InvalidKind(String),
    #[error("invalid operation: {0}")]
    InvalidOp(String),
}

/// A queued local mutation not yet confirmed against the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub kind: EntityKind,
    pub local_id: i64,
    pub op: ChangeOp,
    pub payload: Value,
    pub queued_at: i64,
}

/// Durable queue of pending local mutations, at most one entry per
/// (kind, local id). Later mutations fold into the queued entry instead of
/// appending, so replay order and content stay consistent.
#[derive(Clone)]
pub struct ChangeTracker {
    pool: SqlitePool,
}

impl ChangeTracker {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), TrackerError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn record_create(
        &self,
        kind: EntityKind,
        local_id: i64,
        fields: &Value,
    ) -> Result<(), TrackerError> {
        self.upsert(kind, local_id, ChangeOp::Create, fields, now_unix())
            .await
    }

    /// Folds an update into whatever is already queued for this id: a queued
    /// create or update absorbs the patch; a queued delete wins outright.
    pub async fn record_update(
        &self,
        kind: EntityKind,
        local_id: i64,
        patch: &Value,
    ) -> Result<(), TrackerError> {
        match self.get(kind, local_id).await? {
            None => {
                self.upsert(kind, local_id, ChangeOp::Update, patch, now_unix())
                    .await
            }
            Some(existing) if existing.op == ChangeOp::Delete => {
                debug!(kind = %kind, local_id, "dropping update queued after delete");
                Ok(())
            }
            Some(mut existing) => {
                merge_fields(&mut existing.payload, patch);
                self.upsert(
                    kind,
                    local_id,
                    existing.op,
                    &existing.payload,
                    existing.queued_at,
                )
                .await
            }
        }
    }

    /// Queues a delete. A pending create is cancelled instead: the remote
    /// copy never existed, so there is nothing to delete against. `payload`
    /// should carry the remote identity (id, last seen version) when one
    /// exists; with no remote identity and nothing queued there is nothing
    /// to replay and the call is a no-op.
    pub async fn record_delete(
        &self,
        kind: EntityKind,
        local_id: i64,
        payload: Option<&Value>,
    ) -> Result<(), TrackerError> {
        match self.get(kind, local_id).await? {
            Some(existing) if existing.op == ChangeOp::Create => {
                self.discard(kind, local_id).await
            }
            _ => match payload {
                Some(payload) => {
                    self.upsert(kind, local_id, ChangeOp::Delete, payload, now_unix())
                        .await
                }
                None => self.discard(kind, local_id).await,
            },
        }
    }

    /// Puts a drained change back verbatim, e.g. after the push attempt
    /// never reached the remote service.
    pub async fn restore(&self, change: &PendingChange) -> Result<(), TrackerError> {
        self.upsert(
            change.kind,
            change.local_id,
            change.op,
            &change.payload,
            change.queued_at,
        )
        .await
    }

    /// Returns and clears the queue for one kind in a single transaction.
    /// A drained change is gone for good unless explicitly re-recorded.
    pub async fn drain(&self, kind: EntityKind) -> Result<Vec<PendingChange>, TrackerError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT kind, local_id, op, payload, queued_at
             FROM pending_changes WHERE kind = ?1 ORDER BY id ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM pending_changes WHERE kind = ?1")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        rows.into_iter().map(change_from_row).collect()
    }

    pub async fn discard(&self, kind: EntityKind, local_id: i64) -> Result<(), TrackerError> {
        sqlx::query("DELETE FROM pending_changes WHERE kind = ?1 AND local_id = ?2")
            .bind(kind.as_str())
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn len(&self, kind: EntityKind) -> Result<usize, TrackerError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_changes WHERE kind = ?1")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count as usize)
    }

    async fn get(
        &self,
        kind: EntityKind,
        local_id: i64,
    ) -> Result<Option<PendingChange>, TrackerError> {
        let row = sqlx::query(
            "SELECT kind, local_id, op, payload, queued_at
             FROM pending_changes WHERE kind = ?1 AND local_id = ?2",
        )
        .bind(kind.as_str())
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(change_from_row).transpose()
    }

    async fn upsert(
        &self,
        kind: EntityKind,
        local_id: i64,
        op: ChangeOp,
        payload: &Value,
        queued_at: i64,
    ) -> Result<(), TrackerError> {
        sqlx::query(
            "INSERT INTO pending_changes (kind, local_id, op, payload, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(kind, local_id) DO UPDATE SET
                op = excluded.op,
                payload = excluded.payload,
                queued_at = excluded.queued_at",
        )
        .bind(kind.as_str())
        .bind(local_id)
        .bind(op_as_str(op))
        .bind(serde_json::to_string(payload)?)
        .bind(queued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn op_as_str(op: ChangeOp) -> &'static str {
    match op {
        ChangeOp::Create => "create",
        ChangeOp::Update => "update",
        ChangeOp::Delete => "delete",
    }
}

fn parse_op(value: &str) -> Result<ChangeOp, TrackerError> {
    match value {
        "create" => Ok(ChangeOp::Create),
        "update" => Ok(ChangeOp::Update),
        "delete" => Ok(ChangeOp::Delete),
        other => Err(TrackerError::InvalidOp(other.to_string())),
    }
}

fn change_from_row(row: sqlx::sqlite::SqliteRow) -> Result<PendingChange, TrackerError> {
    let kind: String = row.try_get("kind")?;
    let op: String = row.try_get("op")?;
    let payload: String = row.try_get("payload")?;
    Ok(PendingChange {
        kind: EntityKind::parse(&kind).ok_or(TrackerError::InvalidKind(kind))?,
        local_id: row.try_get("local_id")?,
        op: parse_op(&op)?,
        payload: serde_json::from_str(&payload)?,
        queued_at: row.try_get("queued_at")?,
    })
}
