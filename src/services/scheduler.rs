//! Runs the expiry sweep on an interval or cron cadence.

use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{error, info};

use crate::{
    errors::UploadResult,
    models::job::{Cadence, ScheduledJob},
    services::sweeper::{ExpirySweeper, SweepStats},
};

pub const CLEANUP_JOB: &str = "storage-cleanup";

/// Upper bound on how long the loop sleeps between due checks, so start,
/// stop and cadence changes are picked up.
const MAX_POLL: Duration = Duration::from_secs(60);

/// Shared handle to the cleanup job. Clones see the same job state.
#[derive(Clone)]
pub struct Scheduler {
    job: Arc<RwLock<ScheduledJob>>,
    sweeper: ExpirySweeper,
}

impl Scheduler {
    pub fn new(sweeper: ExpirySweeper, cadence: Cadence) -> Self {
        Self {
            job: Arc::new(RwLock::new(ScheduledJob::new(CLEANUP_JOB, cadence, Utc::now()))),
            sweeper,
        }
    }

    pub async fn status(&self) -> ScheduledJob {
        self.job.read().await.clone()
    }

    /// Enable the job, optionally with a new cadence.
    pub async fn start(&self, cadence: Option<Cadence>) -> ScheduledJob {
        let mut job = self.job.write().await;
        job.start(cadence, Utc::now());
        info!(job = CLEANUP_JOB, cadence = ?job.cadence, next_run = ?job.next_run, "scheduler job started");
        job.clone()
    }

    /// Disable the job. A sweep already in progress finishes.
    pub async fn stop(&self) -> ScheduledJob {
        let mut job = self.job.write().await;
        job.stop();
        info!(job = CLEANUP_JOB, "scheduler job stopped");
        job.clone()
    }

    /// Run the sweep immediately and record it as the latest run.
    pub async fn run_now(&self) -> UploadResult<SweepStats> {
        let started = Utc::now();
        self.job.write().await.running = true;

        let result = self.sweeper.sweep(started).await;

        let mut job = self.job.write().await;
        job.running = false;
        job.mark_ran(started);
        result
    }

    /// Start the background loop. Sweep errors are logged and the loop keeps going.
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(job = CLEANUP_JOB, "scheduler loop started");
            loop {
                let wait = scheduler
                    .job
                    .read()
                    .await
                    .wait_from(Utc::now())
                    .map_or(MAX_POLL, |wait| wait.min(MAX_POLL));
                tokio::time::sleep(wait).await;

                let due = scheduler.job.read().await.is_due(Utc::now());
                if !due {
                    continue;
                }
                if let Err(err) = scheduler.run_now().await {
                    error!(job = CLEANUP_JOB, "scheduled sweep failed: {}", err);
                }
            }
        })
    }
}
