//! Defines routes for the upload service.
//!
//! ## Structure
//! - **Uploads**
//!   - `POST   /uploads`: submit a chunk (multipart `chunk`) or a whole file (`file`)
//!   - `POST   /uploads/finalize`: reassemble, process and persist a session
//!   - `DELETE /uploads/{session_id}`: abandon a session and drop its chunks
//!
//! - **Files and history**
//!   - `GET /files/{bucket}/{*key}`: stream a stored artifact
//!   - `GET /history/{kind}`: the caller's clips, compressions or cuts
//!   - `GET    /clips/{id}`: one clip with its URLs
//!   - `DELETE /clips/{id}`: the owner removes a clip and its files
//!
//! - **Maintenance**
//!   - `POST /maintenance/cleanup`: run the expiry sweep now
//!   - `GET  /maintenance/scheduler`: state of the recurring sweep
//!   - `POST /maintenance/scheduler`: start or stop the recurring sweep

use crate::{
    handlers::{
        clip_handlers::{delete_clip, get_clip},
        file_handlers::get_file,
        health_handlers::{healthz, readyz},
        history_handlers::list_history,
        maintenance_handlers::{control_scheduler, run_cleanup, scheduler_status},
        upload_handlers::{abandon_upload, finalize_upload, submit_upload},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router. `max_body_bytes` caps every request body, multipart included.
pub fn routes(max_body_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", post(submit_upload))
        .route("/uploads/finalize", post(finalize_upload))
        .route("/uploads/{session_id}", delete(abandon_upload))
        .route("/files/{bucket}/{*key}", get(get_file))
        .route("/history/{kind}", get(list_history))
        .route("/clips/{id}", get(get_clip).delete(delete_clip))
        .route("/maintenance/cleanup", post(run_cleanup))
        .route(
            "/maintenance/scheduler",
            get(scheduler_status).post(control_scheduler),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
