//! Chunk submission, finalize and abandon endpoints.
//!
//! `POST /uploads` takes multipart form data. A `chunk` part makes it one
//! chunk of a session; a `file` part makes it a whole-file upload that is
//! stored as a single-chunk session and finalized in the same request.

use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::collections::HashMap;

use crate::{
    errors::{AppError, UploadError, UploadResult},
    handlers::request_owner,
    models::{
        request::{
            ChunkSubmission, DirectUpload, FinalizeRequest, ProcessingParams, UploadRequest,
        },
        upload::{OwnerKey, Purpose, SessionId, UploadMetadata},
    },
    state::AppState,
};

/// `POST /uploads`
pub async fn submit_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let owner = request_owner(&headers)?;
    let form = UploadForm::read(multipart).await?;

    match form.into_request()? {
        UploadRequest::Chunked(submission) => {
            let receipt = state.uploads.submit_chunk(&owner, submission).await?;
            Ok(Json(receipt).into_response())
        }
        UploadRequest::Direct(direct) => {
            let response = finalize_direct(&state, &owner, direct).await?;
            Ok((StatusCode::CREATED, Json(response)).into_response())
        }
    }
}

/// `POST /uploads/finalize`
pub async fn finalize_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FinalizeRequest>,
) -> Result<Response, AppError> {
    let owner = request_owner(&headers)?;
    let response = state.finalizer.finalize(&owner, request).await.map_err(|err| {
        tracing::error!(%owner, stage = %err.stage, "finalize failed: {}", err.error);
        err
    })?;
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

/// `DELETE /uploads/{session_id}`
pub async fn abandon_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let owner = request_owner(&headers)?;
    let session: SessionId = session_id.parse()?;
    let report = state.uploads.abandon(&owner, &session).await;
    tracing::debug!(%owner, %session, ?report, "session abandoned");
    Ok(StatusCode::NO_CONTENT)
}

async fn finalize_direct(
    state: &AppState,
    owner: &OwnerKey,
    direct: DirectUpload,
) -> Result<crate::models::request::FinalizeResponse, AppError> {
    let DirectUpload { payload, finalize } = direct;
    let submission = ChunkSubmission {
        session_id: finalize.session_id.clone(),
        index: 0,
        total_chunks: Some(1),
        payload,
        metadata: UploadMetadata {
            file_name: finalize.file_name.clone(),
            mime_type: finalize.mime_type.clone(),
            purpose: finalize.purpose,
            collection_id: finalize.collection_id.clone(),
        },
    };
    state.uploads.submit_chunk(owner, submission).await?;
    Ok(state.finalizer.finalize(owner, finalize).await?)
}

/// Raw multipart form: text fields plus the single binary part.
#[derive(Debug, Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    payload: Option<Payload>,
}

#[derive(Debug)]
struct Payload {
    whole_file: bool,
    bytes: Bytes,
    file_name: Option<String>,
    content_type: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "chunk" | "file" => {
                    let file_name = field.file_name().map(str::to_string);
                    let content_type = field.content_type().map(str::to_string);
                    let bytes = field.bytes().await.map_err(multipart_error)?;
                    form.payload = Some(Payload {
                        whole_file: name == "file",
                        bytes,
                        file_name,
                        content_type,
                    });
                }
                "" => {}
                _ => {
                    let value = field.text().await.map_err(multipart_error)?;
                    form.fields.insert(name, value);
                }
            }
        }
        Ok(form)
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: std::str::FromStr>(
        &self,
        name: &'static str,
        invalid: impl Fn(String) -> UploadError,
    ) -> UploadResult<Option<T>> {
        match self.text(name) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| invalid(format!("`{}` is not a valid {}", raw, name))),
        }
    }

    /// Resolve the form into one request shape.
    fn into_request(self) -> UploadResult<UploadRequest> {
        let payload = self
            .payload
            .as_ref()
            .ok_or(UploadError::MissingField("chunk"))?;
        let purpose = match self.text("purpose") {
            Some(raw) => raw.parse()?,
            None => Purpose::default(),
        };
        let file_name = self
            .text("fileName")
            .map(str::to_string)
            .or_else(|| payload.file_name.clone())
            .unwrap_or_default();
        let mime_type = self
            .text("mimeType")
            .map(str::to_string)
            .or_else(|| payload.content_type.clone())
            .unwrap_or_default();
        let collection_id = self.text("collectionId").map(str::to_string);

        if !payload.whole_file {
            let session_id: SessionId = self.text("sessionId").unwrap_or_default().parse()?;
            let index = self
                .parsed::<u32>("index", UploadError::InvalidChunk)?
                .ok_or(UploadError::MissingField("index"))?;
            let total_chunks = self.parsed::<u32>("totalChunks", UploadError::InvalidChunk)?;
            return Ok(UploadRequest::Chunked(ChunkSubmission {
                session_id,
                index,
                total_chunks,
                payload: payload.bytes.clone(),
                metadata: UploadMetadata {
                    file_name,
                    mime_type,
                    purpose,
                    collection_id,
                },
            }));
        }

        let session_id = match self.text("sessionId") {
            Some(raw) => raw.parse()?,
            None => SessionId::new_random(),
        };
        let processing_params = ProcessingParams {
            quality: self.parsed("quality", UploadError::InvalidParams)?,
            format: self.text("format").map(str::to_string),
            resolution: self.text("resolution").map(str::to_string),
            fps: self.text("fps").map(str::to_string),
            start_time: self.parsed("startTime", UploadError::InvalidParams)?,
            end_time: self.parsed("endTime", UploadError::InvalidParams)?,
            thumbnail_at: self.parsed("thumbnailAt", UploadError::InvalidParams)?,
        };
        Ok(UploadRequest::Direct(DirectUpload {
            payload: payload.bytes.clone(),
            finalize: FinalizeRequest {
                session_id,
                file_name,
                mime_type,
                purpose,
                collection_id,
                title: self.text("title").map(str::to_string),
                description: self.text("description").map(str::to_string),
                total_chunks: Some(1),
                processing_params,
            },
        }))
    }
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), format!("malformed multipart body: {}", err.body_text()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(payload: Option<bool>, pairs: &[(&str, &str)]) -> UploadForm {
        UploadForm {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            payload: payload.map(|whole_file| Payload {
                whole_file,
                bytes: Bytes::from_static(b"data"),
                file_name: Some("part.webm".into()),
                content_type: Some("video/webm".into()),
            }),
        }
    }

    #[test]
    fn chunk_part_resolves_to_a_chunk_submission() {
        let request = form(
            Some(false),
            &[
                ("sessionId", "s1"),
                ("index", "2"),
                ("totalChunks", "3"),
                ("fileName", "a.mp4"),
                ("purpose", "trim"),
            ],
        )
        .into_request()
        .unwrap();

        match request {
            UploadRequest::Chunked(chunk) => {
                assert_eq!(chunk.index, 2);
                assert_eq!(chunk.total_chunks, Some(3));
                assert_eq!(chunk.metadata.file_name, "a.mp4");
                // Falls back to the part's own content type.
                assert_eq!(chunk.metadata.mime_type, "video/webm");
                assert_eq!(chunk.metadata.purpose, Purpose::Cut);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn file_part_resolves_to_a_direct_upload() {
        let request = form(
            Some(true),
            &[("purpose", "cut"), ("startTime", "1.5"), ("endTime", "4")],
        )
        .into_request()
        .unwrap();

        match request {
            UploadRequest::Direct(direct) => {
                assert_eq!(direct.finalize.file_name, "part.webm");
                assert_eq!(direct.finalize.total_chunks, Some(1));
                assert_eq!(direct.finalize.processing_params.start_time, Some(1.5));
                assert_eq!(direct.finalize.processing_params.end_time, Some(4.0));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn malformed_fields_are_rejected() {
        assert!(matches!(
            form(None, &[("sessionId", "s1")]).into_request(),
            Err(UploadError::MissingField("chunk"))
        ));
        assert!(matches!(
            form(Some(false), &[("sessionId", "s1")]).into_request(),
            Err(UploadError::MissingField("index"))
        ));
        assert!(matches!(
            form(Some(false), &[("sessionId", "s1"), ("index", "-1")]).into_request(),
            Err(UploadError::InvalidChunk(_))
        ));
        assert!(matches!(
            form(Some(false), &[("index", "0")]).into_request(),
            Err(UploadError::MissingField("sessionId"))
        ));
        assert!(matches!(
            form(Some(true), &[("quality", "high")]).into_request(),
            Err(UploadError::InvalidParams(_))
        ));
    }
}
