//! src/services/blob_store.rs
//!
//! BlobStore: the object-storage collaborator used for chunks, finished
//! clips, derivatives and thumbnails. `LocalBlobStore` keeps metadata in
//! SQLite and payloads on local disk, sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`.

use crate::models::blob::{BlobEntry, BlobMeta};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Bucket names used by the upload workflow.
pub mod buckets {
    pub const CLIPS: &str = "clips";
    pub const COMPRESSED: &str = "compressed";
    pub const CUTS: &str = "cuts";
    pub const THUMBNAILS: &str = "thumbnails";
    pub const TEMP: &str = "temp";

    pub const ALL: [&str; 5] = [CLIPS, COMPRESSED, CUTS, THUMBNAILS, TEMP];

    /// Buckets served at `/files`. Chunks in `temp` stay private.
    pub const PUBLIC: [&str; 4] = [CLIPS, COMPRESSED, CUTS, THUMBNAILS];
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("bucket `{0}` does not exist")]
    UnknownBucket(String),
    #[error("blob `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("invalid blob key")]
    InvalidKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Narrow blob-store contract. Every operation is fallible and safe to retry.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `bucket/key`, replacing any previous payload.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> BlobResult<BlobMeta>;

    async fn get(&self, bucket: &str, key: &str) -> BlobResult<Bytes>;

    /// Entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, bucket: &str, prefix: &str) -> BlobResult<Vec<BlobEntry>>;

    async fn delete(&self, bucket: &str, key: &str) -> BlobResult<()>;

    fn public_url(&self, bucket: &str, key: &str) -> String;
}

const MAX_BLOB_KEY_LEN: usize = 1024;

/// SQLite + local disk implementation of [`BlobStore`].
#[derive(Clone)]
pub struct LocalBlobStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    /// Origin prefixed to `/files/{bucket}/{key}` in public URLs.
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create the directory of every known bucket.
    pub async fn ensure_buckets(&self) -> BlobResult<()> {
        for bucket in buckets::ALL {
            fs::create_dir_all(self.bucket_root(bucket)).await?;
        }
        Ok(())
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(&self, key: &str) -> BlobResult<()> {
        if key.is_empty() || key.len() > MAX_BLOB_KEY_LEN {
            return Err(BlobError::InvalidKey);
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(BlobError::InvalidKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BlobError::InvalidKey);
        }
        Ok(())
    }

    fn ensure_bucket_known(&self, bucket: &str) -> BlobResult<()> {
        if buckets::ALL.contains(&bucket) {
            Ok(())
        } else {
            Err(BlobError::UnknownBucket(bucket.to_string()))
        }
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard directories from MD5(bucket/key), to keep directory
    /// sizes bounded.
    fn blob_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::blob_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_meta(&self, bucket: &str, key: &str) -> BlobResult<BlobMeta> {
        sqlx::query_as::<_, BlobMeta>(
            "SELECT bucket, key, content_type, size_bytes, etag, last_modified
             FROM blobs WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            other => BlobError::Sqlx(other),
        })
    }

    /// Metadata plus an open file handle, for streaming a blob out.
    pub async fn open(&self, bucket: &str, key: &str) -> BlobResult<(BlobMeta, File)> {
        self.ensure_bucket_known(bucket)?;
        self.ensure_key_safe(key)?;
        let meta = self.fetch_meta(bucket, key).await?;
        let file = File::open(self.blob_path(bucket, key))
            .await
            .map_err(|err| not_found_or_io(err, bucket, key))?;
        Ok((meta, file))
    }

    /// Write payload to a temp file beside the destination, fsync, then
    /// rename into place.
    async fn write_payload(&self, file_path: &Path, bytes: &[u8]) -> BlobResult<()> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(&tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }
        Ok(())
    }

    /// Remove empty shard directories up to (not including) the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> BlobResult<BlobMeta> {
        self.ensure_bucket_known(bucket)?;
        self.ensure_key_safe(key)?;

        let file_path = self.blob_path(bucket, key);
        self.write_payload(&file_path, &bytes).await?;

        let mut digest = Context::new();
        digest.consume(&bytes);
        let etag = format!("{:x}", digest.compute());

        let upserted = sqlx::query_as::<_, BlobMeta>(
            r#"
            INSERT INTO blobs (bucket, key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING bucket, key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(content_type)
        .bind(bytes.len() as i64)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        debug!(bucket, key, size = bytes.len(), "stored blob");
        Ok(upserted)
    }

    async fn get(&self, bucket: &str, key: &str) -> BlobResult<Bytes> {
        self.ensure_bucket_known(bucket)?;
        self.ensure_key_safe(key)?;
        self.fetch_meta(bucket, key).await?;

        let bytes = fs::read(self.blob_path(bucket, key))
            .await
            .map_err(|err| not_found_or_io(err, bucket, key))?;
        Ok(Bytes::from(bytes))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> BlobResult<Vec<BlobEntry>> {
        self.ensure_bucket_known(bucket)?;

        // substr comparison instead of LIKE: keys may legitimately contain `_`.
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM blobs
             WHERE bucket = ? AND substr(key, 1, length(?)) = ?
             ORDER BY key ASC",
        )
        .bind(bucket)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&*self.db)
        .await?;

        Ok(keys.into_iter().map(BlobEntry::from_key).collect())
    }

    async fn delete(&self, bucket: &str, key: &str) -> BlobResult<()> {
        self.ensure_bucket_known(bucket)?;
        self.ensure_key_safe(key)?;

        let result = sqlx::query("DELETE FROM blobs WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let file_path = self.blob_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob file {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/files/{}/{}", self.public_base_url, bucket, key)
    }
}

fn not_found_or_io(err: io::Error, bucket: &str, key: &str) -> BlobError {
    if err.kind() == ErrorKind::NotFound {
        BlobError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        BlobError::Io(err)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;

    pub(crate) async fn local_store() -> (LocalBlobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(db::test_pool().await, dir.path(), "http://test.local/");
        store.ensure_buckets().await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_overwrites_and_get_returns_latest() {
        let (store, _dir) = local_store().await;

        store
            .put(buckets::TEMP, "a/b/one", Bytes::from_static(b"first"), "text/plain")
            .await
            .unwrap();
        let meta = store
            .put(buckets::TEMP, "a/b/one", Bytes::from_static(b"second!"), "text/plain")
            .await
            .unwrap();

        assert_eq!(meta.size_bytes, 7);
        assert_eq!(meta.etag, format!("{:x}", md5::compute(b"second!")));
        let bytes = store.get(buckets::TEMP, "a/b/one").await.unwrap();
        assert_eq!(&bytes[..], b"second!");
    }

    #[tokio::test]
    async fn list_matches_prefix_literally() {
        let (store, _dir) = local_store().await;
        for key in ["s_1/chunk-0", "s_1/chunk-1", "sx1/chunk-0", "s_10/chunk-0"] {
            store
                .put(buckets::TEMP, key, Bytes::from_static(b"x"), "application/octet-stream")
                .await
                .unwrap();
        }

        let entries = store.list(buckets::TEMP, "s_1/").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["chunk-0", "chunk-1"]);
        assert_eq!(entries[0].key, "s_1/chunk-0");
    }

    #[tokio::test]
    async fn delete_removes_payload_and_prunes_shards() {
        let (store, dir) = local_store().await;
        store
            .put(buckets::CLIPS, "srv/clip.mp4", Bytes::from_static(b"video"), "video/mp4")
            .await
            .unwrap();

        store.delete(buckets::CLIPS, "srv/clip.mp4").await.unwrap();

        assert!(matches!(
            store.get(buckets::CLIPS, "srv/clip.mp4").await,
            Err(BlobError::NotFound { .. })
        ));
        let mut remaining = std::fs::read_dir(dir.path().join(buckets::CLIPS)).unwrap();
        assert!(remaining.next().is_none());
        assert!(matches!(
            store.delete(buckets::CLIPS, "srv/clip.mp4").await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_unsafe_keys_and_unknown_buckets() {
        let (store, _dir) = local_store().await;
        let payload = Bytes::from_static(b"x");

        for key in ["", "/abs", "../escape", "a/../b", "dir/"] {
            assert!(matches!(
                store.put(buckets::TEMP, key, payload.clone(), "x/y").await,
                Err(BlobError::InvalidKey)
            ));
        }
        assert!(matches!(
            store.put("nope", "k", payload, "x/y").await,
            Err(BlobError::UnknownBucket(_))
        ));
    }

    #[tokio::test]
    async fn public_url_points_at_file_route() {
        let store = LocalBlobStore::new(db::test_pool().await, "/tmp", "https://clips.example/");
        assert_eq!(
            store.public_url(buckets::THUMBNAILS, "srv/a.jpg"),
            "https://clips.example/files/thumbnails/srv/a.jpg"
        );
    }
}
