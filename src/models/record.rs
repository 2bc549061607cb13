//! Persisted clip, compression and cut records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::upload::Purpose;

/// Which workflow produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Clip,
    Compression,
    Cut,
}

impl From<Purpose> for MediaKind {
    fn from(purpose: Purpose) -> Self {
        match purpose {
            Purpose::Clip => MediaKind::Clip,
            Purpose::Compress => MediaKind::Compression,
            Purpose::Cut => MediaKind::Cut,
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "clip" | "clips" => Ok(MediaKind::Clip),
            "compression" | "compress" => Ok(MediaKind::Compression),
            "cut" | "cuts" => Ok(MediaKind::Cut),
            other => Err(format!("unknown record kind `{}`", other)),
        }
    }
}

/// A finalized upload, as stored in `media_records`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    pub id: Uuid,
    pub kind: MediaKind,
    pub title: String,
    pub description: String,
    /// `bucket/key` of the primary artifact.
    pub artifact_location: String,
    /// `bucket/key` of the thumbnail, when one was generated.
    pub derived_artifact_location: Option<String>,
    pub owner_id: String,
    pub collection_id: Option<String>,
    /// Size of the reassembled upload.
    pub byte_size: i64,
    /// Size of the transcoded output for compressions and cuts.
    pub processed_size: Option<i64>,
    pub original_file_name: String,
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Fields handed to the record store's create operation.
#[derive(Debug, Clone)]
pub struct NewMediaRecord {
    pub id: Uuid,
    pub kind: MediaKind,
    pub title: String,
    pub description: String,
    pub artifact_location: String,
    pub derived_artifact_location: Option<String>,
    pub owner_id: String,
    pub collection_id: Option<String>,
    pub byte_size: i64,
    pub processed_size: Option<i64>,
    pub original_file_name: String,
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}
