//! Manual trigger, status and control of the expiry sweep.

use axum::{Json, extract::State};

use crate::{
    errors::AppError,
    models::job::{Cadence, ScheduledJob, SchedulerAction, SchedulerCommand},
    services::sweeper::SweepStats,
    state::AppState,
};

/// `POST /maintenance/cleanup`
pub async fn run_cleanup(State(state): State<AppState>) -> Result<Json<SweepStats>, AppError> {
    let stats = state.scheduler.run_now().await?;
    Ok(Json(stats))
}

/// `GET /maintenance/scheduler`
pub async fn scheduler_status(State(state): State<AppState>) -> Json<ScheduledJob> {
    Json(state.scheduler.status().await)
}

/// `POST /maintenance/scheduler`: `start` (optionally with `cronExpression`
/// or `intervalSecs`) or `stop` the recurring sweep.
pub async fn control_scheduler(
    State(state): State<AppState>,
    Json(command): Json<SchedulerCommand>,
) -> Result<Json<ScheduledJob>, AppError> {
    let job = match command.action {
        SchedulerAction::Start => {
            let cadence = match (command.cron_expression.as_deref(), command.interval_secs) {
                (Some(expression), _) => Some(Cadence::cron(expression)?),
                (None, Some(secs)) => Some(Cadence::every(secs)),
                (None, None) => None,
            };
            state.scheduler.start(cadence).await
        }
        SchedulerAction::Stop => state.scheduler.stop().await,
    };
    Ok(Json(job))
}
