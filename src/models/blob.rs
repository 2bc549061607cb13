//! Represents a stored blob (chunk, clip, derivative or thumbnail).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata of a single blob within a bucket.
///
/// The payload bytes live on disk; this row only describes them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BlobMeta {
    /// Bucket the blob belongs to (`clips`, `temp`, ...).
    pub bucket: String,

    /// Path-like key within the bucket.
    pub key: String,

    /// Content type (MIME type) given at write time.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload, lowercase hex.
    pub etag: String,

    /// Timestamp of the last write.
    pub last_modified: DateTime<Utc>,
}

/// One entry of a prefix listing.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BlobEntry {
    /// Full key within the bucket.
    pub key: String,

    /// Last path segment of the key.
    pub name: String,
}

impl BlobEntry {
    pub fn from_key(key: String) -> Self {
        let name = key.rsplit('/').next().unwrap_or(&key).to_string();
        Self { key, name }
    }
}

/// A `bucket/key` pair, as persisted in records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub bucket: String,
    pub key: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse the `bucket/key` form written by `Display`.
    pub fn parse(location: &str) -> Option<Self> {
        let (bucket, key) = location.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(bucket, key))
    }
}

impl std::fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}
