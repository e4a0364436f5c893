use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use sqlx::{Row, SqlitePool, sqlite::SqliteConnectOptions};
use thiserror::Error;

use crate::models::{Entity, EntityKind, merge_fields, now_unix};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        remote_id TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        fields TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(kind, remote_id)
    );
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fields payload error: {0}")]
    Fields(#[from] serde_json::Error),
    #[error("invalid entity kind: {0}")]
    InvalidKind(String),
    #[error("record not found after write")]
    MissingRecord,
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// A durable entity record. `fields` carries the kind-specific payload; the
/// sync bookkeeping lives in the remaining columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub local_id: i64,
    pub kind: EntityKind,
    pub remote_id: Option<String>,
    pub version: i64,
    pub fields: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StoredRecord {
    /// A record with no remote identifier has never been successfully
    /// pushed; one with a remote identifier carries the version last seen
    /// from the remote service.
    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    pub fn decode<T: Entity>(&self) -> Result<T, StoreError> {
        let mut entity: T = serde_json::from_value(self.fields.clone())?;
        entity.attach_meta(
            self.local_id,
            self.remote_id.clone(),
            self.version,
            self.created_at,
            self.updated_at,
        );
        Ok(entity)
    }
}

#[derive(Clone)]
pub struct LibraryStore {
    pool: SqlitePool,
}

impl LibraryStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, kind: EntityKind, fields: &Value) -> Result<StoredRecord, StoreError> {
        self.insert_with_remote(kind, fields, None, 0).await
    }

    pub async fn insert_with_remote(
        &self,
        kind: EntityKind,
        fields: &Value,
        remote_id: Option<&str>,
        version: i64,
    ) -> Result<StoredRecord, StoreError> {
        let now = now_unix();
        let result = sqlx::query(
            "INSERT INTO records (kind, remote_id, version, fields, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(kind.as_str())
        .bind(remote_id)
        .bind(version)
        .bind(serde_json::to_string(fields)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(kind, result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRecord)
    }

    pub async fn get(
        &self,
        kind: EntityKind,
        local_id: i64,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, kind, remote_id, version, fields, created_at, updated_at
             FROM records WHERE kind = ?1 AND id = ?2",
        )
        .bind(kind.as_str())
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(record_from_row).transpose()
    }

    pub async fn get_by_remote(
        &self,
        kind: EntityKind,
        remote_id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, kind, remote_id, version, fields, created_at, updated_at
             FROM records WHERE kind = ?1 AND remote_id = ?2",
        )
        .bind(kind.as_str())
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(record_from_row).transpose()
    }

    pub async fn list(&self, kind: EntityKind) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, remote_id, version, fields, created_at, updated_at
             FROM records WHERE kind = ?1 ORDER BY id ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    /// Merges a partial fields patch into an existing record.
    pub async fn apply_patch(
        &self,
        kind: EntityKind,
        local_id: i64,
        patch: &Value,
    ) -> Result<StoredRecord, StoreError> {
        let record = self
            .get(kind, local_id)
            .await?
            .ok_or(StoreError::MissingRecord)?;
        let mut fields = record.fields;
        merge_fields(&mut fields, patch);
        sqlx::query("UPDATE records SET fields = ?1, updated_at = ?2 WHERE kind = ?3 AND id = ?4")
            .bind(serde_json::to_string(&fields)?)
            .bind(now_unix())
            .bind(kind.as_str())
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        self.get(kind, local_id)
            .await?
            .ok_or(StoreError::MissingRecord)
    }

    /// Records the identity the remote service assigned after a successful
    /// push, together with the content the service echoed back.
    pub async fn confirm_push(
        &self,
        kind: EntityKind,
        local_id: i64,
        remote_id: &str,
        version: i64,
        fields: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE records SET remote_id = ?1, version = ?2, fields = ?3, updated_at = ?4
             WHERE kind = ?5 AND id = ?6",
        )
        .bind(remote_id)
        .bind(version)
        .bind(serde_json::to_string(fields)?)
        .bind(now_unix())
        .bind(kind.as_str())
        .bind(local_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upserts the authoritative remote state by remote identifier
    /// (remote wins).
    pub async fn apply_remote(
        &self,
        kind: EntityKind,
        remote_id: &str,
        version: i64,
        fields: &Value,
    ) -> Result<StoredRecord, StoreError> {
        let now = now_unix();
        sqlx::query(
            "INSERT INTO records (kind, remote_id, version, fields, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(kind, remote_id) DO UPDATE SET
                version = excluded.version,
                fields = excluded.fields,
                updated_at = excluded.updated_at",
        )
        .bind(kind.as_str())
        .bind(remote_id)
        .bind(version)
        .bind(serde_json::to_string(fields)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_by_remote(kind, remote_id)
            .await?
            .ok_or(StoreError::MissingRecord)
    }

    pub async fn delete(&self, kind: EntityKind, local_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records WHERE kind = ?1 AND id = ?2")
            .bind(kind.as_str())
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let fields: String = row.try_get("fields")?;
    Ok(StoredRecord {
        local_id: row.try_get("id")?,
        kind: EntityKind::parse(&kind).ok_or(StoreError::InvalidKind(kind))?,
        remote_id: row.try_get("remote_id")?,
        version: row.try_get("version")?,
        fields: serde_json::from_str(&fields)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("shelfmark").join("library.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Paper, ReadingStatus};
    use serde_json::json;

    async fn memory_store() -> LibraryStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = LibraryStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_assigns_local_id_and_version_zero() {
        let store = memory_store().await;
        let record = store
            .insert(
                EntityKind::Paper,
                &json!({"title": "A", "reading_status": "New", "authors": []}),
            )
            .await
            .unwrap();

        assert!(record.local_id > 0);
        assert_eq!(record.version, 0);
        assert!(!record.is_synced());
    }

    #[tokio::test]
    async fn apply_patch_merges_fields_and_bumps_updated_at() {
        let store = memory_store().await;
        let record = store
            .insert(EntityKind::Collection, &json!({"name": "Optimizers"}))
            .await
            .unwrap();

        let patched = store
            .apply_patch(
                EntityKind::Collection,
                record.local_id,
                &json!({"description": "First-order methods"}),
            )
            .await
            .unwrap();

        assert_eq!(patched.fields["name"], "Optimizers");
        assert_eq!(patched.fields["description"], "First-order methods");
    }

    #[tokio::test]
    async fn confirm_push_sets_remote_identity() {
        let store = memory_store().await;
        let record = store
            .insert(
                EntityKind::Paper,
                &json!({"title": "A", "reading_status": "New", "authors": []}),
            )
            .await
            .unwrap();

        store
            .confirm_push(
                EntityKind::Paper,
                record.local_id,
                "p-1",
                1,
                &record.fields,
            )
            .await
            .unwrap();

        let synced = store
            .get(EntityKind::Paper, record.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(synced.remote_id.as_deref(), Some("p-1"));
        assert_eq!(synced.version, 1);
    }

    #[tokio::test]
    async fn apply_remote_upserts_by_remote_id() {
        let store = memory_store().await;

        let inserted = store
            .apply_remote(
                EntityKind::Paper,
                "p-9",
                4,
                &json!({"title": "Remote", "reading_status": "Read", "authors": []}),
            )
            .await
            .unwrap();
        assert_eq!(inserted.version, 4);

        let updated = store
            .apply_remote(
                EntityKind::Paper,
                "p-9",
                5,
                &json!({"title": "Remote v5", "reading_status": "Read", "authors": []}),
            )
            .await
            .unwrap();
        assert_eq!(updated.local_id, inserted.local_id);
        assert_eq!(updated.version, 5);
        assert_eq!(updated.fields["title"], "Remote v5");
    }

    #[tokio::test]
    async fn decode_attaches_bookkeeping_meta() {
        let store = memory_store().await;
        let record = store
            .insert(
                EntityKind::Paper,
                &json!({
                    "title": "Paxos Made Simple",
                    "authors": ["Lamport"],
                    "reading_status": "Reading"
                }),
            )
            .await
            .unwrap();

        let paper: Paper = record.decode().unwrap();
        assert_eq!(paper.local_id, record.local_id);
        assert_eq!(paper.title, "Paxos Made Simple");
        assert_eq!(paper.reading_status, ReadingStatus::Reading);
        assert!(paper.remote_id.is_none());
    }

    #[tokio::test]
    async fn records_survive_reopening_a_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("library.db").display()
        );

        let store = LibraryStore::new(&url).await.unwrap();
        let record = store
            .insert(EntityKind::Collection, &json!({"name": "Durable"}))
            .await
            .unwrap();
        drop(store);

        let reopened = LibraryStore::new(&url).await.unwrap();
        let found = reopened
            .get(EntityKind::Collection, record.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.fields["name"], "Durable");
    }

    #[tokio::test]
    async fn records_of_one_kind_do_not_leak_into_another() {
        let store = memory_store().await;
        store
            .insert(EntityKind::Collection, &json!({"name": "Systems"}))
            .await
            .unwrap();

        assert!(store.list(EntityKind::Paper).await.unwrap().is_empty());
        assert_eq!(store.list(EntityKind::Collection).await.unwrap().len(), 1);
    }
}
