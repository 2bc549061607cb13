//! Rebuilds an uploaded file from its stored chunks.

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream};
use tracing::debug;

use crate::{
    errors::{UploadError, UploadResult},
    models::upload::{
        ChunkRef, OwnerKey, ReassembledArtifact, SessionId, check_total_chunks, file_extension,
    },
    services::chunk_store::ChunkStore,
};

/// Chunk downloads kept in flight at once. Results are still consumed in
/// index order.
const FETCH_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct Reassembler {
    chunks: ChunkStore,
    max_chunks: u32,
}

/// Declared properties of the file being rebuilt.
#[derive(Debug, Clone, Default)]
pub struct ReassemblyHints {
    pub total_chunks: Option<u32>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

impl Reassembler {
    pub fn new(chunks: ChunkStore, max_chunks: u32) -> Self {
        Self { chunks, max_chunks }
    }

    pub fn max_chunks(&self) -> u32 {
        self.max_chunks
    }

    /// Concatenate chunks `0..total` in index order.
    ///
    /// The expected total comes from `hints`, then the session manifest,
    /// then the highest stored index. A hinted total that disagrees with the
    /// manifest, or a stored index at or past the total, is rejected rather
    /// than truncated. Never deletes anything.
    pub async fn reassemble(
        &self,
        owner: &OwnerKey,
        session: &SessionId,
        hints: ReassemblyHints,
    ) -> UploadResult<ReassembledArtifact> {
        let manifest = self.chunks.manifest(owner, session).await?;
        let stored = self.chunks.list(owner, session).await?;

        let recorded = manifest.as_ref().and_then(|m| m.total_chunks);
        let declared = match (hints.total_chunks, recorded) {
            (Some(requested), Some(recorded)) if requested != recorded => {
                return Err(UploadError::InvalidChunk(format!(
                    "totalChunks {} does not match the {} declared while uploading",
                    requested, recorded
                )));
            }
            (requested, recorded) => requested.or(recorded),
        };
        let total = match (declared, stored.last()) {
            (Some(total), _) => total,
            (None, Some(last)) => last.index.checked_add(1).ok_or_else(|| {
                UploadError::InvalidChunk(format!("chunk index {} is out of range", last.index))
            })?,
            (None, None) => {
                return Err(UploadError::IncompleteUpload {
                    missing_index: 0,
                    total: 0,
                });
            }
        };
        check_total_chunks(total, self.max_chunks)?;

        let ordered = select_contiguous(stored, total)?;

        let file_name = hints
            .file_name
            .or_else(|| manifest.as_ref().map(|m| m.metadata.file_name.clone()))
            .unwrap_or_default();
        let mime_type = hints
            .mime_type
            .or_else(|| manifest.as_ref().map(|m| m.metadata.mime_type.clone()))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let chunks = self.chunks.clone();
        let payloads: Vec<(u32, Bytes)> = stream::iter(ordered)
            .map(move |chunk| {
                let chunks = chunks.clone();
                async move {
                    match chunks.get(&chunk).await {
                        Ok(bytes) => Ok((chunk.index, bytes)),
                        // Listed but gone by the time it was read.
                        Err(UploadError::IncompleteUpload { missing_index, .. }) => {
                            Err(UploadError::IncompleteUpload {
                                missing_index,
                                total,
                            })
                        }
                        Err(err) => Err(err),
                    }
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        if let Some((index, _)) = payloads.iter().find(|(_, bytes)| bytes.is_empty()) {
            return Err(UploadError::EmptyUpload(format!(
                "chunk {} of session {} is zero-length",
                index, session
            )));
        }

        let total_len = payloads.iter().map(|(_, bytes)| bytes.len()).sum();
        let mut buffer = BytesMut::with_capacity(total_len);
        for (_, bytes) in &payloads {
            buffer.extend_from_slice(bytes);
        }
        if buffer.is_empty() {
            return Err(UploadError::EmptyUpload(format!(
                "session {} reassembled to zero bytes",
                session
            )));
        }

        debug!(%owner, %session, chunks = total, bytes = buffer.len(), "reassembled upload");
        Ok(ReassembledArtifact {
            bytes: buffer.freeze(),
            mime_type,
            file_extension: file_extension(&file_name),
        })
    }
}

/// Keep chunks `0..total`, failing on the first gap or on any index at or
/// past `total`. Input must be sorted by index.
fn select_contiguous(stored: Vec<ChunkRef>, total: u32) -> UploadResult<Vec<ChunkRef>> {
    let mut ordered = Vec::with_capacity(stored.len());
    let mut expected = 0u32;
    for chunk in stored {
        if chunk.index >= total {
            if expected < total {
                break;
            }
            return Err(UploadError::InvalidChunk(format!(
                "chunk {} is past the declared total of {}",
                chunk.index, total
            )));
        }
        if chunk.index < expected {
            // Same index listed twice; the store holds one payload per index.
            continue;
        }
        if chunk.index != expected {
            return Err(UploadError::IncompleteUpload {
                missing_index: expected,
                total,
            });
        }
        ordered.push(chunk);
        expected += 1;
    }
    if expected < total {
        return Err(UploadError::IncompleteUpload {
            missing_index: expected,
            total,
        });
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::upload::{Purpose, SessionManifest, UploadMetadata},
        services::blob_store::tests::local_store,
    };
    use std::sync::Arc;

    const MAX_CHUNKS: u32 = 64;

    async fn setup() -> (ChunkStore, Reassembler, OwnerKey, SessionId, tempfile::TempDir) {
        let (blobs, dir) = local_store().await;
        let chunks = ChunkStore::new(Arc::new(blobs));
        (
            chunks.clone(),
            Reassembler::new(chunks, MAX_CHUNKS),
            OwnerKey::parse("alice").unwrap(),
            "sess".parse().unwrap(),
            dir,
        )
    }

    fn hints(total: u32) -> ReassemblyHints {
        ReassemblyHints {
            total_chunks: Some(total),
            file_name: Some("Match.MP4".into()),
            mime_type: Some("video/mp4".into()),
        }
    }

    #[tokio::test]
    async fn concatenates_in_numeric_order() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        let mut expected = Vec::new();
        for index in 0..12u32 {
            expected.extend_from_slice(format!("[{}]", index).as_bytes());
        }
        for index in (0..12u32).rev() {
            chunks
                .put(&owner, &session, index, Bytes::from(format!("[{}]", index)))
                .await
                .unwrap();
        }

        let artifact = reassembler
            .reassemble(&owner, &session, hints(12))
            .await
            .unwrap();
        assert_eq!(&artifact.bytes[..], &expected[..]);
        assert_eq!(artifact.file_extension, "mp4");
        assert_eq!(artifact.mime_type, "video/mp4");
    }

    #[tokio::test]
    async fn last_write_wins_for_a_resubmitted_index() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        chunks.put(&owner, &session, 0, Bytes::from_static(b"aa")).await.unwrap();
        chunks.put(&owner, &session, 1, Bytes::from_static(b"bb")).await.unwrap();
        chunks.put(&owner, &session, 2, Bytes::from_static(b"old")).await.unwrap();
        chunks.put(&owner, &session, 2, Bytes::from_static(b"new")).await.unwrap();

        let artifact = reassembler
            .reassemble(&owner, &session, hints(3))
            .await
            .unwrap();
        assert_eq!(&artifact.bytes[..], b"aabbnew");
    }

    #[tokio::test]
    async fn names_the_first_missing_index() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        for index in [0u32, 1, 2, 4] {
            chunks.put(&owner, &session, index, Bytes::from_static(b"x")).await.unwrap();
        }

        let err = reassembler
            .reassemble(&owner, &session, hints(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompleteUpload {
                missing_index: 3,
                total: 5
            }
        ));
    }

    #[tokio::test]
    async fn trailing_gap_is_reported() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        chunks.put(&owner, &session, 0, Bytes::from_static(b"x")).await.unwrap();
        chunks.put(&owner, &session, 1, Bytes::from_static(b"y")).await.unwrap();

        let err = reassembler
            .reassemble(&owner, &session, hints(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompleteUpload {
                missing_index: 2,
                total: 3
            }
        ));
    }

    #[tokio::test]
    async fn empty_session_is_incomplete() {
        let (_, reassembler, owner, session, _dir) = setup().await;
        let err = reassembler
            .reassemble(&owner, &session, ReassemblyHints::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompleteUpload {
                missing_index: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn zero_length_chunk_is_an_empty_upload() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        chunks.put(&owner, &session, 0, Bytes::from_static(b"abc")).await.unwrap();
        // Bypasses submit_chunk validation, as a corrupted write would.
        chunks.put(&owner, &session, 1, Bytes::new()).await.unwrap();
        chunks.put(&owner, &session, 2, Bytes::from_static(b"def")).await.unwrap();

        let err = reassembler
            .reassemble(&owner, &session, hints(3))
            .await
            .unwrap_err();
        match err {
            UploadError::EmptyUpload(detail) => assert!(detail.contains("chunk 1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    async fn put_manifest(chunks: &ChunkStore, owner: &OwnerKey, session: &SessionId, total: u32) {
        let manifest = SessionManifest {
            metadata: UploadMetadata {
                file_name: "match.mp4".into(),
                mime_type: "video/mp4".into(),
                purpose: Purpose::Clip,
                collection_id: Some("srv".into()),
            },
            total_chunks: Some(total),
        };
        chunks.put_manifest(owner, session, &manifest).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_chunk_writes_reassemble_in_order() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        let mut expected = Vec::new();
        let mut writers = tokio::task::JoinSet::new();
        for index in 0..16u32 {
            let payload = Bytes::from(vec![index as u8; 1000 + index as usize]);
            expected.extend_from_slice(&payload);
            let (chunks, owner, session) = (chunks.clone(), owner.clone(), session.clone());
            writers.spawn(async move { chunks.put(&owner, &session, index, payload).await });
        }
        while let Some(written) = writers.join_next().await {
            written.unwrap().unwrap();
        }

        let artifact = reassembler
            .reassemble(&owner, &session, hints(16))
            .await
            .unwrap();
        assert_eq!(artifact.bytes.len(), expected.len());
        assert!(artifact.bytes[..] == expected[..]);
    }

    #[tokio::test]
    async fn oversized_totals_are_rejected() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        chunks.put(&owner, &session, 0, Bytes::from_static(b"x")).await.unwrap();

        for total in [u32::MAX, MAX_CHUNKS + 1] {
            let err = reassembler
                .reassemble(&owner, &session, hints(total))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidChunk(_)), "total {total}: {err:?}");
        }
    }

    #[tokio::test]
    async fn zero_total_is_invalid_not_incomplete() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        chunks.put(&owner, &session, 0, Bytes::from_static(b"x")).await.unwrap();

        let err = reassembler
            .reassemble(&owner, &session, hints(0))
            .await
            .unwrap_err();
        match err {
            UploadError::InvalidChunk(detail) => assert!(detail.contains("at least 1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn highest_possible_index_does_not_overflow() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        chunks
            .put(&owner, &session, u32::MAX, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let err = reassembler
            .reassemble(&owner, &session, ReassemblyHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidChunk(_)));
    }

    #[tokio::test]
    async fn short_total_never_truncates() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        for index in 0..3u32 {
            chunks.put(&owner, &session, index, Bytes::from_static(b"abcd")).await.unwrap();
        }

        // No manifest: the extra stored chunk is the problem.
        let err = reassembler
            .reassemble(&owner, &session, hints(2))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidChunk(_)));

        // With a manifest the disagreement itself is reported.
        put_manifest(&chunks, &owner, &session, 3).await;
        let err = reassembler
            .reassemble(&owner, &session, hints(2))
            .await
            .unwrap_err();
        match err {
            UploadError::InvalidChunk(detail) => assert!(detail.contains("does not match")),
            other => panic!("unexpected error: {other:?}"),
        }

        let artifact = reassembler
            .reassemble(&owner, &session, hints(3))
            .await
            .unwrap();
        assert_eq!(artifact.bytes.len(), 12);
    }

    #[tokio::test]
    async fn manifest_total_applies_without_a_hint() {
        let (chunks, reassembler, owner, session, _dir) = setup().await;
        chunks.put(&owner, &session, 0, Bytes::from_static(b"x")).await.unwrap();
        put_manifest(&chunks, &owner, &session, 2).await;

        let err = reassembler
            .reassemble(&owner, &session, ReassemblyHints::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompleteUpload {
                missing_index: 1,
                total: 2
            }
        ));
    }

    #[test]
    fn select_contiguous_rejects_indices_past_total() {
        let refs = |indices: &[u32]| {
            indices
                .iter()
                .map(|&index| ChunkRef {
                    index,
                    key: format!("chunk-{}", index),
                })
                .collect::<Vec<_>>()
        };
        assert!(matches!(
            select_contiguous(refs(&[0, 1, 7]), 2),
            Err(UploadError::InvalidChunk(_))
        ));
        assert!(matches!(
            select_contiguous(refs(&[0, 7]), 2),
            Err(UploadError::IncompleteUpload { missing_index: 1, total: 2 })
        ));
        assert_eq!(select_contiguous(refs(&[0, 1]), 2).unwrap().len(), 2);
        assert!(select_contiguous(refs(&[1]), 1).is_err());
    }
}
