//! Turns a complete chunk set into a stored artifact and a persisted record.
//!
//! A finalize runs `received -> reassembling -> transcoding -> persisting ->
//! cleaning_up -> done`. Fatal errors carry the stage they happened in and
//! leave the session's chunks in place so the client can retry without
//! uploading again.

use chrono::{Duration, Utc};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    errors::{FinalizeError, FinalizeStage, UploadError, UploadResult},
    models::{
        blob::BlobLocation,
        record::{MediaKind, NewMediaRecord},
        request::{FinalizeRequest, FinalizeResponse},
        upload::{
            DerivedOutput, OwnerKey, Purpose, ReassembledArtifact, SessionId, check_total_chunks,
        },
    },
    services::{
        authorization::Authorizer,
        blob_store::{BlobStore, buckets},
        cleanup::CleanupQueue,
        derivative::{DerivativeGenerator, TranscodeParams},
        reassembler::{Reassembler, ReassemblyHints},
        records::RecordStore,
    },
};

/// Offset of the clip thumbnail when the client does not pick one.
pub const DEFAULT_THUMBNAIL_AT: f64 = 1.0;

type SessionKey = (String, String);

/// Sessions currently being finalized in this process.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<SessionKey>>>);

impl InFlight {
    fn acquire(&self, owner: &OwnerKey, session: &SessionId) -> Option<InFlightGuard> {
        let key = (owner.as_str().to_string(), session.as_str().to_string());
        let mut set = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.0.clone(),
            key,
        })
    }
}

/// Releases the session when the finalize ends, however it ends.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<SessionKey>>>,
    key: SessionKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.key);
    }
}

/// What the transcoding stage produced.
struct Outputs {
    primary: Primary,
    thumbnail: Option<DerivedOutput>,
    processed_size: Option<i64>,
}

/// The artifact the record points at.
struct Primary {
    bytes: bytes::Bytes,
    mime_type: String,
    extension: String,
}

#[derive(Clone)]
pub struct FinalizationCoordinator {
    reassembler: Reassembler,
    derivatives: DerivativeGenerator,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    authorizer: Arc<dyn Authorizer>,
    cleanup: CleanupQueue,
    expiry: Duration,
    in_flight: InFlight,
}

impl FinalizationCoordinator {
    pub fn new(
        reassembler: Reassembler,
        derivatives: DerivativeGenerator,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        authorizer: Arc<dyn Authorizer>,
        cleanup: CleanupQueue,
        expiry: Duration,
    ) -> Self {
        Self {
            reassembler,
            derivatives,
            blobs,
            records,
            authorizer,
            cleanup,
            expiry,
            in_flight: InFlight::default(),
        }
    }

    pub async fn finalize(
        &self,
        owner: &OwnerKey,
        request: FinalizeRequest,
    ) -> Result<FinalizeResponse, FinalizeError> {
        let session = request.session_id.clone();
        debug!(%owner, %session, purpose = %request.purpose, stage = %FinalizeStage::Received, "finalize");

        let params = self
            .check_request(owner, &request)
            .await
            .map_err(|err| err.at(FinalizeStage::Received))?;

        let _guard = self.in_flight.acquire(owner, &session).ok_or_else(|| {
            UploadError::FinalizeInProgress(session.to_string()).at(FinalizeStage::Received)
        })?;

        debug!(%owner, %session, stage = %FinalizeStage::Reassembling, "finalize");
        let hints = ReassemblyHints {
            total_chunks: request.total_chunks,
            file_name: Some(request.file_name.clone()),
            mime_type: Some(request.mime_type.clone()),
        };
        let artifact = self
            .reassembler
            .reassemble(owner, &session, hints)
            .await
            .map_err(|err| err.at(FinalizeStage::Reassembling))?;

        debug!(%owner, %session, bytes = artifact.len(), stage = %FinalizeStage::Transcoding, "finalize");
        let outputs = self
            .produce(&session, &artifact, &request, params.as_ref())
            .await
            .map_err(|err| err.at(FinalizeStage::Transcoding))?;

        debug!(%owner, %session, stage = %FinalizeStage::Persisting, "finalize");
        let response = self
            .persist(owner, &request, &artifact, outputs)
            .await
            .map_err(|err| err.at(FinalizeStage::Persisting))?;

        debug!(%owner, %session, stage = %FinalizeStage::CleaningUp, "finalize");
        self.cleanup.enqueue(owner.clone(), session.clone());

        info!(
            %owner,
            %session,
            record = %response.record_id,
            original_size = response.original_size,
            stage = %FinalizeStage::Done,
            "upload finalized"
        );
        Ok(response)
    }

    /// Field checks and authorization. Also builds the transcode parameters
    /// so bad ones are rejected before any chunk is read.
    async fn check_request(
        &self,
        owner: &OwnerKey,
        request: &FinalizeRequest,
    ) -> UploadResult<Option<TranscodeParams>> {
        if request.file_name.trim().is_empty() {
            return Err(UploadError::MissingField("fileName"));
        }
        if request.mime_type.trim().is_empty() {
            return Err(UploadError::MissingField("mimeType"));
        }
        if let Some(total) = request.total_chunks {
            check_total_chunks(total, self.reassembler.max_chunks())?;
        }
        if request.purpose == Purpose::Clip {
            if request.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
                return Err(UploadError::MissingField("title"));
            }
            if request
                .collection_id
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
            {
                return Err(UploadError::MissingField("collectionId"));
            }
        }

        let params = TranscodeParams::for_purpose(request.purpose, &request.processing_params)?;
        if let Some(params) = &params {
            params.validate()?;
        }

        let authorized = self
            .authorizer
            .is_authorized(owner, request.collection_id.as_deref(), request.purpose)
            .await?;
        if !authorized {
            return Err(UploadError::Forbidden(format!(
                "{} may not finalize a {} here",
                owner, request.purpose
            )));
        }
        Ok(params)
    }

    async fn produce(
        &self,
        session: &SessionId,
        artifact: &ReassembledArtifact,
        request: &FinalizeRequest,
        params: Option<&TranscodeParams>,
    ) -> UploadResult<Outputs> {
        match params {
            None => {
                let at = request
                    .processing_params
                    .thumbnail_at
                    .unwrap_or(DEFAULT_THUMBNAIL_AT);
                let thumbnail = match self.derivatives.extract_still_frame(session, artifact, at).await {
                    Ok(frame) => Some(frame),
                    Err(err) => {
                        warn!(%session, "thumbnail generation failed, continuing without one: {}", err);
                        None
                    }
                };
                Ok(Outputs {
                    primary: Primary {
                        bytes: artifact.bytes.clone(),
                        mime_type: artifact.mime_type.clone(),
                        extension: extension_or_default(&artifact.file_extension),
                    },
                    thumbnail,
                    processed_size: None,
                })
            }
            Some(params) => {
                let derived = self.derivatives.transcode(session, artifact, params).await?;
                let processed_size = i64::try_from(derived.size()).ok();
                Ok(Outputs {
                    primary: Primary {
                        bytes: derived.bytes,
                        mime_type: derived.mime_type,
                        extension: derived.extension,
                    },
                    thumbnail: None,
                    processed_size,
                })
            }
        }
    }

    async fn persist(
        &self,
        owner: &OwnerKey,
        request: &FinalizeRequest,
        artifact: &ReassembledArtifact,
        outputs: Outputs,
    ) -> UploadResult<FinalizeResponse> {
        let record_id = Uuid::new_v4();
        let kind = MediaKind::from(request.purpose);
        let collection = request.collection_id.clone().unwrap_or_default();

        let primary = match request.purpose {
            Purpose::Clip => BlobLocation::new(
                buckets::CLIPS,
                format!("{}/{}.{}", collection, record_id, outputs.primary.extension),
            ),
            Purpose::Compress => BlobLocation::new(
                buckets::COMPRESSED,
                format!("{}/{}.{}", owner, record_id, outputs.primary.extension),
            ),
            Purpose::Cut => BlobLocation::new(
                buckets::CUTS,
                format!("{}/{}.{}", owner, record_id, outputs.primary.extension),
            ),
        };
        let primary_size = outputs.primary.bytes.len();
        self.blobs
            .put(
                &primary.bucket,
                &primary.key,
                outputs.primary.bytes,
                &outputs.primary.mime_type,
            )
            .await?;

        let mut thumbnail_location = None;
        let mut thumbnail_size = None;
        if let Some(frame) = outputs.thumbnail {
            let location =
                BlobLocation::new(buckets::THUMBNAILS, format!("{}/{}.jpg", collection, record_id));
            let size = frame.size();
            match self
                .blobs
                .put(&location.bucket, &location.key, frame.bytes, &frame.mime_type)
                .await
            {
                Ok(_) => {
                    thumbnail_location = Some(location);
                    thumbnail_size = Some(size);
                }
                Err(err) => warn!(%record_id, "storing thumbnail failed, continuing without one: {}", err),
            }
        }

        let now = Utc::now();
        let expires_at = match request.purpose {
            Purpose::Clip => None,
            Purpose::Compress | Purpose::Cut => Some(now + self.expiry),
        };
        let title = request
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| request.file_name.clone());

        let record = NewMediaRecord {
            id: record_id,
            kind,
            title,
            description: request.description.clone().unwrap_or_default(),
            artifact_location: primary.to_string(),
            derived_artifact_location: thumbnail_location.as_ref().map(ToString::to_string),
            owner_id: owner.as_str().to_string(),
            collection_id: request.collection_id.clone(),
            byte_size: i64::try_from(artifact.len()).unwrap_or(i64::MAX),
            processed_size: outputs.processed_size,
            original_file_name: request.file_name.clone(),
            format: primary_extension(&primary),
            created_at: now,
            expires_at,
        };

        if let Err(err) = self.records.create(record).await {
            warn!(
                %record_id,
                artifact = %primary,
                thumbnail = ?thumbnail_location.as_ref().map(ToString::to_string),
                "record write failed; stored artifacts kept"
            );
            return Err(err);
        }

        let derived_size = match request.purpose {
            Purpose::Clip => thumbnail_size.map(|size| size as u64),
            Purpose::Compress | Purpose::Cut => Some(primary_size as u64),
        };

        Ok(FinalizeResponse {
            record_id,
            artifact_url: self.blobs.public_url(&primary.bucket, &primary.key),
            derived_artifact_url: thumbnail_location
                .as_ref()
                .map(|loc| self.blobs.public_url(&loc.bucket, &loc.key)),
            original_size: artifact.len() as u64,
            derived_size,
        })
    }
}

fn extension_or_default(extension: &str) -> String {
    if extension.is_empty() {
        "mp4".to_string()
    } else {
        extension.to_string()
    }
}

fn primary_extension(location: &BlobLocation) -> String {
    location
        .key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_string())
        .unwrap_or_default()
}
