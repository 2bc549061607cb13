//! Single-clip lookup and owner deletion.

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use uuid::Uuid;

use crate::{
    errors::AppError,
    handlers::{history_handlers::HistoryEntry, request_owner},
    services::library::Removal,
    state::AppState,
};

/// `GET /clips/{id}`
pub async fn get_clip(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HistoryEntry>, AppError> {
    let record = state
        .library
        .clip(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("clip {} not found", id)))?;
    Ok(Json(HistoryEntry::new(record, &state.files)))
}

/// `DELETE /clips/{id}`: only the clip's owner may delete it.
pub async fn delete_clip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Removal>, AppError> {
    let owner = request_owner(&headers)?;
    let removal = state
        .library
        .delete_clip(&owner, id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("clip {} not found", id)))?;
    Ok(Json(removal))
}
