//! Serves stored blobs at the URLs handed out in finalize responses.
//! Bodies are streamed from disk rather than buffered.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

use crate::{
    errors::AppError,
    models::blob::BlobMeta,
    services::blob_store::{BlobError, buckets},
    state::AppState,
};

/// `GET /files/{bucket}/{*key}`. Only finished artifacts are served; the
/// `temp` bucket answers 404 like a missing file.
pub async fn get_file(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    if !buckets::PUBLIC.contains(&bucket.as_str()) {
        return Err(BlobError::NotFound { bucket, key }.into());
    }
    let (meta, file) = state.files.open(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_blob_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_blob_headers(headers: &mut HeaderMap, meta: &BlobMeta) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
