//! Request and response shapes of the client-facing upload flow.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::upload::{Purpose, SessionId, UploadMetadata};

/// An upload request, resolved once at the HTTP boundary.
#[derive(Debug)]
pub enum UploadRequest {
    /// One byte range of a larger file.
    Chunked(ChunkSubmission),
    /// A whole file in a single request, finalized immediately.
    Direct(DirectUpload),
}

/// A single chunk submission.
#[derive(Debug, Clone)]
pub struct ChunkSubmission {
    pub session_id: SessionId,
    pub index: u32,
    pub total_chunks: Option<u32>,
    pub payload: Bytes,
    pub metadata: UploadMetadata,
}

/// A whole file plus everything finalize needs.
#[derive(Debug, Clone)]
pub struct DirectUpload {
    pub payload: Bytes,
    pub finalize: FinalizeRequest,
}

/// Result of accepting one chunk.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub accepted: bool,
    pub is_final: bool,
    pub index: u32,
    pub session_id: SessionId,
}

/// Parameters of the derivative operation selected by the upload purpose.
///
/// Resolution and frame rate accept either `"original"` or a value such as
/// `"720p"` / `30`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingParams {
    #[serde(default)]
    pub quality: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub resolution: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub fps: Option<String>,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub thumbnail_at: Option<f64>,
}

/// Body of `POST /uploads/finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    #[serde(alias = "fileId")]
    pub session_id: SessionId,
    #[serde(default)]
    pub file_name: String,
    #[serde(default, alias = "fileType")]
    pub mime_type: String,
    #[serde(default, alias = "uploadType")]
    pub purpose: Purpose,
    #[serde(default, alias = "serverId")]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub total_chunks: Option<u32>,
    #[serde(default)]
    pub processing_params: ProcessingParams,
}

/// Successful finalize response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub record_id: Uuid,
    pub artifact_url: String,
    pub derived_artifact_url: Option<String>,
    pub original_size: u64,
    pub derived_size: Option<u64>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    }))
}
