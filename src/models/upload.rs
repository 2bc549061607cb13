//! Upload sessions, chunks and the transient artifacts built from them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::errors::UploadError;

const MAX_IDENTIFIER_LEN: usize = 128;
const ANONYMOUS: &str = "anonymous";

/// Identifiers end up as storage path segments, so only a conservative
/// character set is accepted.
fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// The uploading principal: an authenticated user id or the anonymous marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    pub fn parse(value: &str) -> Result<Self, UploadError> {
        if is_safe_identifier(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(UploadError::Forbidden(format!(
                "owner `{}` is not a valid identity",
                value
            )))
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque client-chosen identifier of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(UploadError::MissingField("sessionId"));
        }
        if !is_safe_identifier(value) {
            return Err(UploadError::InvalidChunk(format!(
                "session id `{}` must be at most {} characters of [A-Za-z0-9_-]",
                value, MAX_IDENTIFIER_LEN
            )));
        }
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for SessionId {
    type Error = UploadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the reassembled file will be used for; selects the derivative
/// operation performed at finalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    #[default]
    Clip,
    Compress,
    #[serde(alias = "trim")]
    Cut,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Clip => "clip",
            Purpose::Compress => "compress",
            Purpose::Cut => "cut",
        }
    }
}

impl FromStr for Purpose {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clip" => Ok(Purpose::Clip),
            "compress" => Ok(Purpose::Compress),
            "cut" | "trim" => Ok(Purpose::Cut),
            "" => Err(UploadError::MissingField("purpose")),
            other => Err(UploadError::InvalidParams(format!(
                "unknown purpose `{}`",
                other
            ))),
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-declared description of the file being uploaded. Not verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub file_name: String,
    pub mime_type: String,
    pub purpose: Purpose,
    #[serde(default)]
    pub collection_id: Option<String>,
}

/// Session metadata kept beside the chunks so a later finalize knows how
/// many chunks to expect. Deleted together with the chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionManifest {
    #[serde(flatten)]
    pub metadata: UploadMetadata,
    pub total_chunks: Option<u32>,
}

/// A stored chunk as enumerated by the chunk store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub index: u32,
    pub key: String,
}

/// The whole uploaded file, concatenated from its chunks in index order.
#[derive(Debug, Clone)]
pub struct ReassembledArtifact {
    pub bytes: Bytes,
    pub mime_type: String,
    pub file_extension: String,
}

impl ReassembledArtifact {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A file produced from a reassembled artifact by the external transcoder.
#[derive(Debug, Clone)]
pub struct DerivedOutput {
    pub bytes: Bytes,
    pub mime_type: String,
    pub extension: String,
}

impl DerivedOutput {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Lowercased extension of a client file name, without the dot.
pub fn file_extension(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Chunk ceiling per session when none is configured. At the 2 MiB chunk
/// size clients use this is roughly 20 GiB.
pub const DEFAULT_MAX_CHUNKS: u32 = 10_000;

/// A declared chunk count must be at least 1 and at most `max_chunks`.
pub fn check_total_chunks(total: u32, max_chunks: u32) -> Result<(), UploadError> {
    if total == 0 {
        return Err(UploadError::InvalidChunk(
            "totalChunks must be at least 1".into(),
        ));
    }
    if total > max_chunks {
        return Err(UploadError::InvalidChunk(format!(
            "totalChunks {} exceeds the limit of {}",
            total, max_chunks
        )));
    }
    Ok(())
}
