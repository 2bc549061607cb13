use axum::http::HeaderMap;

use crate::{errors::UploadResult, models::upload::OwnerKey};

pub mod clip_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod history_handlers;
pub mod maintenance_handlers;
pub mod upload_handlers;

/// Header carrying the authenticated user id, set by the fronting auth layer.
pub const OWNER_HEADER: &str = "x-clipit-user";

/// The caller's owner key. A missing or blank header means anonymous.
pub(crate) fn request_owner(headers: &HeaderMap) -> UploadResult<OwnerKey> {
    match headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
    {
        Some(user) if !user.is_empty() => OwnerKey::parse(user),
        _ => Ok(OwnerKey::anonymous()),
    }
}
