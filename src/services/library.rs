//! Lookup and owner-initiated removal of finalized clips.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        record::{MediaKind, MediaRecord},
        upload::OwnerKey,
    },
    services::{blob_store::BlobStore, records::RecordStore, sweeper::remove_record_files},
};

/// Outcome of deleting one clip.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Removal {
    pub id: Uuid,
    pub files_deleted: u64,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct MediaLibrary {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
}

impl MediaLibrary {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { records, blobs }
    }

    pub async fn clip(&self, id: Uuid) -> UploadResult<Option<MediaRecord>> {
        Ok(self
            .records
            .get(id)
            .await?
            .filter(|record| record.kind == MediaKind::Clip))
    }

    /// Delete a clip owned by `owner`: the record first, then its video and
    /// thumbnail. File failures are reported in the result and logged.
    ///
    /// `Ok(None)` means there was no such clip.
    pub async fn delete_clip(&self, owner: &OwnerKey, id: Uuid) -> UploadResult<Option<Removal>> {
        let Some(record) = self.clip(id).await? else {
            return Ok(None);
        };
        if owner.is_anonymous() || record.owner_id != owner.as_str() {
            return Err(UploadError::Forbidden(format!(
                "{} may not delete clip {}",
                owner, id
            )));
        }
        if !self.records.delete(id).await? {
            // Removed by a concurrent request.
            return Ok(None);
        }

        let files = remove_record_files(self.blobs.as_ref(), &record).await;
        if !files.errors.is_empty() {
            warn!(clip = %id, errors = ?files.errors, "clip deleted but some files remain");
        }
        info!(clip = %id, %owner, files = files.deleted, "clip deleted");
        Ok(Some(Removal {
            id,
            files_deleted: files.deleted,
            errors: files.errors,
        }))
    }
}
