//! Accepts chunk submissions for an upload session.

use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        request::{ChunkReceipt, ChunkSubmission},
        upload::{OwnerKey, SessionId, SessionManifest, UploadMetadata, check_total_chunks},
    },
    services::{
        authorization::Authorizer,
        chunk_store::{ChunkStore, CleanupReport},
    },
};

#[derive(Clone)]
pub struct ChunkedUploadSession {
    chunks: ChunkStore,
    authorizer: Arc<dyn Authorizer>,
    max_chunks: u32,
}

impl ChunkedUploadSession {
    pub fn new(chunks: ChunkStore, authorizer: Arc<dyn Authorizer>, max_chunks: u32) -> Self {
        Self {
            chunks,
            authorizer,
            max_chunks,
        }
    }

    /// Store one chunk. Resubmitting an index replaces the earlier payload.
    ///
    /// `is_final` only says this was the last index; whether every earlier
    /// index arrived is checked at reassembly.
    pub async fn submit_chunk(
        &self,
        owner: &OwnerKey,
        submission: ChunkSubmission,
    ) -> UploadResult<ChunkReceipt> {
        let ChunkSubmission {
            session_id,
            index,
            total_chunks,
            payload,
            metadata,
        } = submission;

        validate_metadata(&metadata)?;
        if payload.is_empty() {
            return Err(UploadError::InvalidChunk(format!(
                "chunk {} of session {} is empty",
                index, session_id
            )));
        }
        if let Some(total) = total_chunks {
            check_total_chunks(total, self.max_chunks)?;
            if index >= total {
                return Err(UploadError::InvalidChunk(format!(
                    "index {} is outside [0, {})",
                    index, total
                )));
            }
        } else if index >= self.max_chunks {
            return Err(UploadError::InvalidChunk(format!(
                "index {} exceeds the limit of {} chunks",
                index, self.max_chunks
            )));
        }

        let authorized = self
            .authorizer
            .is_authorized(owner, metadata.collection_id.as_deref(), metadata.purpose)
            .await?;
        if !authorized {
            return Err(UploadError::Forbidden(format!(
                "{} may not upload for {} in this collection",
                owner, metadata.purpose
            )));
        }

        debug!(
            %owner,
            session = %session_id,
            index,
            size = payload.len(),
            "storing chunk"
        );
        self.chunks.put(owner, &session_id, index, payload).await?;

        if total_chunks.is_some() {
            let manifest = SessionManifest {
                metadata,
                total_chunks,
            };
            self.chunks
                .put_manifest(owner, &session_id, &manifest)
                .await?;
        }

        let is_final = total_chunks.is_some_and(|total| index == total - 1);
        if is_final {
            info!(%owner, session = %session_id, index, "final chunk received, ready for finalization");
        }

        Ok(ChunkReceipt {
            accepted: true,
            is_final,
            index,
            session_id,
        })
    }

    /// Drop every chunk of a session the client gave up on.
    pub async fn abandon(&self, owner: &OwnerKey, session: &SessionId) -> CleanupReport {
        info!(%owner, %session, "abandoning upload session");
        self.chunks.delete_session(owner, session).await
    }
}

fn validate_metadata(metadata: &UploadMetadata) -> UploadResult<()> {
    if metadata.file_name.trim().is_empty() {
        return Err(UploadError::MissingField("fileName"));
    }
    if metadata.mime_type.trim().is_empty() {
        return Err(UploadError::MissingField("mimeType"));
    }
    if metadata.purpose == crate::models::upload::Purpose::Clip
        && metadata
            .collection_id
            .as_deref()
            .is_none_or(|id| id.trim().is_empty())
    {
        return Err(UploadError::MissingField("collectionId"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::upload::Purpose,
        services::blob_store::tests::local_store,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(bool, AtomicUsize);

    #[async_trait]
    impl Authorizer for Fixed {
        async fn is_authorized(&self, _: &OwnerKey, _: Option<&str>, _: Purpose) -> UploadResult<bool> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(self.0)
        }
    }

    fn submission(index: u32, total: Option<u32>, payload: &'static [u8]) -> ChunkSubmission {
        ChunkSubmission {
            session_id: "sess".parse().unwrap(),
            index,
            total_chunks: total,
            payload: Bytes::from_static(payload),
            metadata: UploadMetadata {
                file_name: "clip.mp4".into(),
                mime_type: "video/mp4".into(),
                purpose: Purpose::Clip,
                collection_id: Some("srv".into()),
            },
        }
    }

    async fn service(allow: bool) -> (ChunkedUploadSession, ChunkStore, Arc<Fixed>, tempfile::TempDir) {
        let (blobs, dir) = local_store().await;
        let chunks = ChunkStore::new(Arc::new(blobs));
        let auth = Arc::new(Fixed(allow, AtomicUsize::new(0)));
        (
            ChunkedUploadSession::new(chunks.clone(), auth.clone(), 8),
            chunks,
            auth,
            dir,
        )
    }

    #[tokio::test]
    async fn last_index_is_final() {
        let (svc, _, _, _dir) = service(true).await;
        let owner = OwnerKey::parse("alice").unwrap();

        let first = svc.submit_chunk(&owner, submission(0, Some(2), b"ab")).await.unwrap();
        assert!(first.accepted);
        assert!(!first.is_final);

        let last = svc.submit_chunk(&owner, submission(1, Some(2), b"cd")).await.unwrap();
        assert!(last.is_final);
        assert_eq!(last.index, 1);
    }

    #[tokio::test]
    async fn rejects_bad_chunks_before_authorizing() {
        let (svc, _, auth, _dir) = service(true).await;
        let owner = OwnerKey::parse("alice").unwrap();

        assert!(matches!(
            svc.submit_chunk(&owner, submission(0, Some(1), b"")).await,
            Err(UploadError::InvalidChunk(_))
        ));
        assert!(matches!(
            svc.submit_chunk(&owner, submission(3, Some(3), b"x")).await,
            Err(UploadError::InvalidChunk(_))
        ));
        assert!(matches!(
            svc.submit_chunk(&owner, submission(0, Some(0), b"x")).await,
            Err(UploadError::InvalidChunk(_))
        ));

        assert!(matches!(
            svc.submit_chunk(&owner, submission(0, Some(u32::MAX), b"x")).await,
            Err(UploadError::InvalidChunk(_))
        ));
        assert!(matches!(
            svc.submit_chunk(&owner, submission(u32::MAX, None, b"x")).await,
            Err(UploadError::InvalidChunk(_))
        ));
        assert!(matches!(
            svc.submit_chunk(&owner, submission(8, None, b"x")).await,
            Err(UploadError::InvalidChunk(_))
        ));

        let mut missing_name = submission(0, Some(1), b"x");
        missing_name.metadata.file_name.clear();
        assert!(matches!(
            svc.submit_chunk(&owner, missing_name).await,
            Err(UploadError::MissingField("fileName"))
        ));
        assert_eq!(auth.1.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn forbidden_owner_never_touches_storage() {
        let (svc, chunks, _, _dir) = service(false).await;
        let owner = OwnerKey::parse("mallory").unwrap();

        let err = svc
            .submit_chunk(&owner, submission(0, Some(1), b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Forbidden(_)));

        let session: SessionId = "sess".parse().unwrap();
        assert!(chunks.list(&owner, &session).await.unwrap().is_empty());
        assert!(chunks.manifest(&owner, &session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandon_removes_chunks_and_manifest() {
        let (svc, chunks, _, _dir) = service(true).await;
        let owner = OwnerKey::parse("alice").unwrap();
        svc.submit_chunk(&owner, submission(0, Some(2), b"ab")).await.unwrap();

        let session: SessionId = "sess".parse().unwrap();
        let report = svc.abandon(&owner, &session).await;
        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, 0);
        assert!(chunks.list(&owner, &session).await.unwrap().is_empty());
    }
}
