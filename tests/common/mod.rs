#![allow(dead_code)]

use async_trait::async_trait;
use clipit_upload::{
    config::AppConfig,
    db,
    errors::{UploadError, UploadResult},
    services::transcoder::{MediaTool, ToolJob},
    state::AppState,
};
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;

/// Stands in for ffmpeg: copies the input to the output, or fails every job.
pub struct StubTool {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl StubTool {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTool for StubTool {
    async fn execute(&self, job: &ToolJob) -> UploadResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(UploadError::TranscodeFailed {
                diagnostic: "Invalid data found when processing input".into(),
            });
        }
        tokio::fs::copy(&job.input, &job.output)
            .await
            .map_err(|err| UploadError::TranscodeFailed {
                diagnostic: err.to_string(),
            })?;
        Ok(())
    }

    async fn read_duration(&self, _input: &Path) -> UploadResult<f64> {
        Ok(30.0)
    }
}

pub struct TestApp {
    pub state: AppState,
    pub cfg: AppConfig,
    _dir: TempDir,
}

/// A fully wired service over a temp directory and an in-memory database.
/// `alice` is a member of collection `srv`.
pub async fn spawn_app(tool: Arc<StubTool>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let cfg = AppConfig {
        host: "127.0.0.1".into(),
        port: 0,
        storage_dir: dir.path().join("blobs"),
        scratch_dir: dir.path().join("scratch"),
        database_url: "sqlite::memory:".into(),
        public_base_url: "http://clipit.test".into(),
        ffmpeg_path: "ffmpeg".into(),
        ffprobe_path: "ffprobe".into(),
        transcode_timeout_secs: 5,
        expiry_hours: 6,
        cleanup_interval_secs: 3600,
        cleanup_cron: None,
        max_body_bytes: 16 * 1024 * 1024,
        max_chunks: 16,
    };

    let pool = db::connect(&cfg.database_url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    sqlx::query("INSERT INTO collection_members (collection_id, user_id) VALUES ('srv', 'alice')")
        .execute(&pool)
        .await
        .unwrap();

    let (state, _worker) = AppState::build(Arc::new(pool), &cfg, tool).await.unwrap();
    TestApp {
        state,
        cfg,
        _dir: dir,
    }
}

/// Deterministic, non-repeating test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
