//! Removes expired compressions and cuts together with their stored files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    errors::UploadResult,
    models::{blob::BlobLocation, record::MediaRecord},
    services::{
        blob_store::{BlobError, BlobStore},
        records::RecordStore,
    },
};

/// Totals of one sweep.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub records_deleted: u64,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
}

impl ExpirySweeper {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { records, blobs }
    }

    /// Delete every record expired at `now`, files first.
    ///
    /// A record whose files could not be deleted is kept for the next sweep.
    /// Only listing the expired records can fail the sweep as a whole.
    pub async fn sweep(&self, now: DateTime<Utc>) -> UploadResult<SweepStats> {
        let expired = self.records.list_expired(now).await?;
        let mut stats = SweepStats::default();

        for record in expired {
            if self.delete_files(&record, &mut stats).await {
                match self.records.delete(record.id).await {
                    Ok(true) => stats.records_deleted += 1,
                    Ok(false) => {}
                    Err(err) => stats.errors.push(format!("record {}: {}", record.id, err)),
                }
            }
        }

        if stats.errors.is_empty() {
            info!(
                files = stats.files_deleted,
                bytes = stats.bytes_freed,
                records = stats.records_deleted,
                "expiry sweep finished"
            );
        } else {
            warn!(errors = stats.errors.len(), "expiry sweep finished with errors");
        }
        Ok(stats)
    }

    /// Returns whether every file of the record is gone.
    async fn delete_files(&self, record: &MediaRecord, stats: &mut SweepStats) -> bool {
        let removal = remove_record_files(self.blobs.as_ref(), record).await;
        stats.files_deleted += removal.deleted;
        stats.errors.extend(removal.errors);

        if removal.complete {
            stats.bytes_freed += u64::try_from(record.processed_size.unwrap_or(record.byte_size)).unwrap_or(0);
        }
        removal.complete
    }
}

/// What deleting one record's files achieved.
#[derive(Debug, Default)]
pub(crate) struct FileRemoval {
    pub deleted: u64,
    pub errors: Vec<String>,
    /// No stored file of the record is left behind.
    pub complete: bool,
}

/// Delete the artifact and thumbnail of `record`. Files that are already
/// gone count as removed.
pub(crate) async fn remove_record_files(blobs: &dyn BlobStore, record: &MediaRecord) -> FileRemoval {
    let locations = std::iter::once(record.artifact_location.as_str())
        .chain(record.derived_artifact_location.as_deref());

    let mut removal = FileRemoval {
        complete: true,
        ..FileRemoval::default()
    };
    for raw in locations {
        let Some(location) = BlobLocation::parse(raw) else {
            removal
                .errors
                .push(format!("record {}: malformed location `{}`", record.id, raw));
            continue;
        };
        match blobs.delete(&location.bucket, &location.key).await {
            Ok(()) => removal.deleted += 1,
            Err(BlobError::NotFound { .. }) => {}
            Err(err) => {
                warn!(record = %record.id, %location, "could not delete record file: {}", err);
                removal.errors.push(format!("{}: {}", location, err));
                removal.complete = false;
            }
        }
    }
    removal
}
