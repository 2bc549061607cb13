//! Chunk persistence on top of a [`BlobStore`].
//!
//! Chunks live in the `temp` bucket under `chunks/{owner}/{session}/chunk-{index}`,
//! next to an optional `manifest.json` describing the session.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    errors::{UploadError, UploadResult},
    models::upload::{ChunkRef, OwnerKey, SessionId, SessionManifest},
    services::blob_store::{BlobError, BlobStore, buckets},
};

const CHUNK_PREFIX: &str = "chunk-";
const MANIFEST_NAME: &str = "manifest.json";

/// Outcome of a best-effort session delete.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ChunkStore {
    blobs: Arc<dyn BlobStore>,
}

impl ChunkStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn session_prefix(owner: &OwnerKey, session: &SessionId) -> String {
        format!("chunks/{}/{}/", owner, session)
    }

    fn chunk_key(owner: &OwnerKey, session: &SessionId, index: u32) -> String {
        format!("{}{}{}", Self::session_prefix(owner, session), CHUNK_PREFIX, index)
    }

    fn manifest_key(owner: &OwnerKey, session: &SessionId) -> String {
        format!("{}{}", Self::session_prefix(owner, session), MANIFEST_NAME)
    }

    /// Parse `chunk-N` into `N`. Anything else is not a chunk.
    fn parse_index(name: &str) -> Option<u32> {
        let digits = name.strip_prefix(CHUNK_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Store one chunk, replacing whatever was stored at that index.
    pub async fn put(
        &self,
        owner: &OwnerKey,
        session: &SessionId,
        index: u32,
        payload: Bytes,
    ) -> UploadResult<()> {
        let key = Self::chunk_key(owner, session, index);
        self.blobs
            .put(buckets::TEMP, &key, payload, "application/octet-stream")
            .await?;
        Ok(())
    }

    /// Stored chunks of a session, ordered by numeric index.
    pub async fn list(&self, owner: &OwnerKey, session: &SessionId) -> UploadResult<Vec<ChunkRef>> {
        let prefix = Self::session_prefix(owner, session);
        let entries = self.blobs.list(buckets::TEMP, &prefix).await?;

        let mut chunks: Vec<ChunkRef> = entries
            .into_iter()
            .filter_map(|entry| {
                // Only direct children of the session prefix.
                let name = entry.key.strip_prefix(&prefix)?;
                let index = Self::parse_index(name)?;
                Some(ChunkRef {
                    index,
                    key: entry.key,
                })
            })
            .collect();
        // The backend orders by key, which puts chunk-10 before chunk-2.
        chunks.sort_by_key(|chunk| chunk.index);
        Ok(chunks)
    }

    pub async fn get(&self, chunk: &ChunkRef) -> UploadResult<Bytes> {
        self.blobs
            .get(buckets::TEMP, &chunk.key)
            .await
            .map_err(|err| match err {
                BlobError::NotFound { .. } => UploadError::IncompleteUpload {
                    missing_index: chunk.index,
                    total: chunk.index.saturating_add(1),
                },
                other => other.into(),
            })
    }

    pub async fn put_manifest(
        &self,
        owner: &OwnerKey,
        session: &SessionId,
        manifest: &SessionManifest,
    ) -> UploadResult<()> {
        let body = serde_json::to_vec(manifest)
            .map_err(|err| UploadError::StorageUnavailable(err.to_string()))?;
        self.blobs
            .put(
                buckets::TEMP,
                &Self::manifest_key(owner, session),
                Bytes::from(body),
                "application/json",
            )
            .await?;
        Ok(())
    }

    /// The session manifest, if one was written.
    pub async fn manifest(
        &self,
        owner: &OwnerKey,
        session: &SessionId,
    ) -> UploadResult<Option<SessionManifest>> {
        match self
            .blobs
            .get(buckets::TEMP, &Self::manifest_key(owner, session))
            .await
        {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(manifest) => Ok(Some(manifest)),
                Err(err) => {
                    warn!(%owner, %session, "ignoring unreadable session manifest: {}", err);
                    Ok(None)
                }
            },
            Err(BlobError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete every blob of the session. Failures are logged and counted,
    /// never returned.
    pub async fn delete_session(&self, owner: &OwnerKey, session: &SessionId) -> CleanupReport {
        let prefix = Self::session_prefix(owner, session);
        let mut report = CleanupReport::default();

        let entries = match self.blobs.list(buckets::TEMP, &prefix).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%owner, %session, "could not list chunks for cleanup: {}", err);
                report.failed += 1;
                return report;
            }
        };

        for entry in entries {
            match self.blobs.delete(buckets::TEMP, &entry.key).await {
                Ok(()) => report.deleted += 1,
                Err(BlobError::NotFound { .. }) => {
                    debug!(key = %entry.key, "chunk already gone");
                }
                Err(err) => {
                    warn!(key = %entry.key, "failed to delete chunk: {}", err);
                    report.failed += 1;
                }
            }
        }

        debug!(%owner, %session, ?report, "session cleanup finished");
        report
    }
}
