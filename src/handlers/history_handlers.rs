use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use chrono::Utc;
use serde::Serialize;

use crate::{
    errors::AppError,
    handlers::request_owner,
    models::{
        blob::BlobLocation,
        record::{MediaKind, MediaRecord},
    },
    services::blob_store::{BlobStore, LocalBlobStore},
    state::AppState,
};

/// A record plus the public URLs of its files.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub record: MediaRecord,
    pub artifact_url: Option<String>,
    pub derived_artifact_url: Option<String>,
}

impl HistoryEntry {
    pub fn new(record: MediaRecord, files: &LocalBlobStore) -> Self {
        let url = |location: &str| {
            BlobLocation::parse(location).map(|loc| files.public_url(&loc.bucket, &loc.key))
        };
        Self {
            artifact_url: url(&record.artifact_location),
            derived_artifact_url: record.derived_artifact_location.as_deref().and_then(url),
            record,
        }
    }
}

/// `GET /history/{kind}`: the caller's unexpired clips, compressions or cuts.
pub async fn list_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let owner = request_owner(&headers)?;
    let kind: MediaKind = kind.parse().map_err(AppError::bad_request)?;

    let records = state
        .records
        .list_for_owner(owner.as_str(), kind, Utc::now())
        .await?;

    let entries = records
        .into_iter()
        .map(|record| HistoryEntry::new(record, &state.files))
        .collect();
    Ok(Json(entries))
}
