//! Persistence of finalized clip, compression and cut records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    errors::{UploadError, UploadResult},
    models::record::{MediaKind, MediaRecord, NewMediaRecord},
};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record. An id collision is a storage failure.
    async fn create(&self, record: NewMediaRecord) -> UploadResult<MediaRecord>;

    /// The owner's records of `kind` that have not expired at `now`, newest first.
    async fn list_for_owner(
        &self,
        owner_id: &str,
        kind: MediaKind,
        now: DateTime<Utc>,
    ) -> UploadResult<Vec<MediaRecord>>;

    /// Records whose `expires_at` is at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> UploadResult<Vec<MediaRecord>>;

    async fn get(&self, id: Uuid) -> UploadResult<Option<MediaRecord>>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> UploadResult<bool>;
}

#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Arc<SqlitePool>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

const RECORD_COLUMNS: &str = "id, kind, title, description, artifact_location, \
     derived_artifact_location, owner_id, collection_id, byte_size, processed_size, \
     original_file_name, format, created_at, expires_at";

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create(&self, record: NewMediaRecord) -> UploadResult<MediaRecord> {
        let sql = format!(
            "INSERT INTO media_records ({cols}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {cols}",
            cols = RECORD_COLUMNS
        );
        let created = sqlx::query_as::<_, MediaRecord>(&sql)
            .bind(record.id)
            .bind(record.kind)
            .bind(&record.title)
            .bind(&record.description)
            .bind(&record.artifact_location)
            .bind(&record.derived_artifact_location)
            .bind(&record.owner_id)
            .bind(&record.collection_id)
            .bind(record.byte_size)
            .bind(record.processed_size)
            .bind(&record.original_file_name)
            .bind(&record.format)
            .bind(record.created_at)
            .bind(record.expires_at)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    UploadError::StorageUnavailable(format!("record {} already exists", record.id))
                }
                _ => UploadError::from(err),
            })?;

        tracing::debug!(id = %created.id, kind = ?created.kind, "record created");
        Ok(created)
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        kind: MediaKind,
        now: DateTime<Utc>,
    ) -> UploadResult<Vec<MediaRecord>> {
        let sql = format!(
            "SELECT {} FROM media_records \
             WHERE owner_id = ? AND kind = ? AND (expires_at IS NULL OR expires_at > ?) \
             ORDER BY created_at DESC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, MediaRecord>(&sql)
            .bind(owner_id)
            .bind(kind)
            .bind(now)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> UploadResult<Vec<MediaRecord>> {
        let sql = format!(
            "SELECT {} FROM media_records \
             WHERE expires_at IS NOT NULL AND expires_at <= ? \
             ORDER BY expires_at",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, MediaRecord>(&sql)
            .bind(now)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    async fn get(&self, id: Uuid) -> UploadResult<Option<MediaRecord>> {
        let sql = format!("SELECT {} FROM media_records WHERE id = ?", RECORD_COLUMNS);
        let row = sqlx::query_as::<_, MediaRecord>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> UploadResult<bool> {
        let result = sqlx::query("DELETE FROM media_records WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Duration;

    fn record(kind: MediaKind, owner: &str, created_at: DateTime<Utc>, ttl: Option<Duration>) -> NewMediaRecord {
        NewMediaRecord {
            id: Uuid::new_v4(),
            kind,
            title: "ace".into(),
            description: String::new(),
            artifact_location: "clips/srv/a.mp4".into(),
            derived_artifact_location: None,
            owner_id: owner.into(),
            collection_id: None,
            byte_size: 10,
            processed_size: Some(4),
            original_file_name: "a.mp4".into(),
            format: "mp4".into(),
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
        }
    }

    #[tokio::test]
    async fn create_round_trips_every_column() {
        let store = SqliteRecordStore::new(db::test_pool().await);
        let now = Utc::now();
        let mut new = record(MediaKind::Compression, "alice", now, Some(Duration::hours(6)));
        new.derived_artifact_location = Some("thumbnails/srv/a.jpg".into());

        let created = store.create(new.clone()).await.unwrap();
        assert_eq!(created.id, new.id);
        assert_eq!(created.kind, MediaKind::Compression);
        assert_eq!(created.processed_size, Some(4));
        assert_eq!(created.derived_artifact_location.as_deref(), Some("thumbnails/srv/a.jpg"));
        assert_eq!(created.expires_at, new.expires_at);

        let fetched = store.get(new.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "ace");
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_a_storage_failure() {
        let store = SqliteRecordStore::new(db::test_pool().await);
        let new = record(MediaKind::Clip, "alice", Utc::now(), None);
        store.create(new.clone()).await.unwrap();

        let err = store.create(new).await.unwrap_err();
        assert!(matches!(err, UploadError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn history_hides_other_owners_kinds_and_expired_rows() {
        let store = SqliteRecordStore::new(db::test_pool().await);
        let now = Utc::now();
        let old = now - Duration::hours(10);

        let fresh = store
            .create(record(MediaKind::Cut, "alice", now, Some(Duration::hours(6))))
            .await
            .unwrap();
        let expired = store
            .create(record(MediaKind::Cut, "alice", old, Some(Duration::hours(6))))
            .await
            .unwrap();
        store.create(record(MediaKind::Cut, "bob", now, None)).await.unwrap();
        store.create(record(MediaKind::Clip, "alice", now, None)).await.unwrap();

        let history = store.list_for_owner("alice", MediaKind::Cut, now).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, fresh.id);

        let due = store.list_expired(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, expired.id);

        assert!(store.delete(expired.id).await.unwrap());
        assert!(!store.delete(expired.id).await.unwrap());
        assert!(store.list_expired(now).await.unwrap().is_empty());
    }
}
