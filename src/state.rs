//! Shared state handed to every handler.

use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use tokio::task::JoinHandle;

use crate::{
    config::AppConfig,
    services::{
        authorization::{Authorizer, SqliteAuthorizer},
        blob_store::{BlobResult, BlobStore, LocalBlobStore},
        chunk_store::ChunkStore,
        cleanup::CleanupQueue,
        derivative::DerivativeGenerator,
        finalizer::FinalizationCoordinator,
        library::MediaLibrary,
        reassembler::Reassembler,
        records::{RecordStore, SqliteRecordStore},
        scheduler::Scheduler,
        sweeper::ExpirySweeper,
        transcoder::MediaTool,
        upload_session::ChunkedUploadSession,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    /// Concrete store, used for streaming downloads.
    pub files: LocalBlobStore,
    pub uploads: ChunkedUploadSession,
    pub finalizer: FinalizationCoordinator,
    pub records: Arc<dyn RecordStore>,
    pub library: MediaLibrary,
    pub scheduler: Scheduler,
    pub scratch_dir: PathBuf,
}

impl AppState {
    /// Wire every service from configuration.
    ///
    /// Spawns the chunk cleanup worker, so this must run inside a tokio
    /// runtime. The scheduler loop is not started here.
    pub async fn build(
        db: Arc<SqlitePool>,
        cfg: &AppConfig,
        tool: Arc<dyn MediaTool>,
    ) -> BlobResult<(Self, JoinHandle<()>)> {
        let files = LocalBlobStore::new(db.clone(), &cfg.storage_dir, &cfg.public_base_url);
        files.ensure_buckets().await?;
        tokio::fs::create_dir_all(&cfg.scratch_dir).await?;

        let blobs: Arc<dyn BlobStore> = Arc::new(files.clone());
        let chunks = ChunkStore::new(blobs.clone());
        let authorizer: Arc<dyn Authorizer> = Arc::new(SqliteAuthorizer::new(db.clone()));
        let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(db.clone()));
        let (cleanup, cleanup_worker) = CleanupQueue::spawn(chunks.clone());

        let finalizer = FinalizationCoordinator::new(
            Reassembler::new(chunks.clone(), cfg.max_chunks),
            DerivativeGenerator::new(tool, &cfg.scratch_dir),
            blobs.clone(),
            records.clone(),
            authorizer.clone(),
            cleanup,
            cfg.expiry(),
        );
        let library = MediaLibrary::new(records.clone(), blobs.clone());
        let scheduler = Scheduler::new(
            ExpirySweeper::new(records.clone(), blobs),
            cfg.cleanup_cadence(),
        );

        let state = Self {
            db,
            files,
            uploads: ChunkedUploadSession::new(chunks, authorizer, cfg.max_chunks),
            finalizer,
            records,
            library,
            scheduler,
            scratch_dir: cfg.scratch_dir.clone(),
        };
        Ok((state, cleanup_worker))
    }
}
