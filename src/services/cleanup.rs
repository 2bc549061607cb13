//! Detached chunk cleanup.
//!
//! Finalize hands finished sessions to a single background worker over an
//! unbounded channel and returns without waiting for the deletes.

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    models::upload::{OwnerKey, SessionId},
    services::chunk_store::ChunkStore,
};

#[derive(Debug)]
struct CleanupJob {
    owner: OwnerKey,
    session: SessionId,
}

/// Sending half of the cleanup worker. Cheap to clone.
#[derive(Clone)]
pub struct CleanupQueue {
    tx: mpsc::UnboundedSender<CleanupJob>,
}

impl CleanupQueue {
    /// Start the worker. It runs until every queue handle is dropped.
    pub fn spawn(chunks: ChunkStore) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<CleanupJob>();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let report = chunks.delete_session(&job.owner, &job.session).await;
                if report.failed > 0 {
                    warn!(
                        owner = %job.owner,
                        session = %job.session,
                        deleted = report.deleted,
                        failed = report.failed,
                        "chunk cleanup left blobs behind"
                    );
                } else {
                    debug!(
                        owner = %job.owner,
                        session = %job.session,
                        deleted = report.deleted,
                        "chunks cleaned up"
                    );
                }
            }
            info!("cleanup worker stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue a session's chunks for deletion. Never blocks or fails.
    pub fn enqueue(&self, owner: OwnerKey, session: SessionId) {
        if let Err(err) = self.tx.send(CleanupJob { owner, session }) {
            let job = err.0;
            warn!(
                owner = %job.owner,
                session = %job.session,
                "cleanup worker is gone; chunks left in place"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_store::tests::local_store;
    use bytes::Bytes;
    use std::sync::Arc;

    #[tokio::test]
    async fn worker_deletes_queued_sessions() {
        let (blobs, _dir) = local_store().await;
        let chunks = ChunkStore::new(Arc::new(blobs));
        let owner = OwnerKey::parse("alice").unwrap();
        let session: SessionId = "done".parse().unwrap();
        for index in 0..3 {
            chunks.put(&owner, &session, index, Bytes::from_static(b"x")).await.unwrap();
        }

        let (queue, worker) = CleanupQueue::spawn(chunks.clone());
        queue.enqueue(owner.clone(), session.clone());
        drop(queue);
        worker.await.unwrap();

        assert!(chunks.list(&owner, &session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_after_worker_exit_does_not_panic() {
        let (blobs, _dir) = local_store().await;
        let (queue, worker) = CleanupQueue::spawn(ChunkStore::new(Arc::new(blobs)));
        worker.abort();
        let _ = worker.await;

        queue.enqueue(OwnerKey::anonymous(), "late".parse().unwrap());
    }
}
