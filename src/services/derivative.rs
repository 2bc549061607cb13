//! Produces transcoded videos, trims and thumbnails from a reassembled upload.
//!
//! The transcoder works on paths, so every call writes the artifact into a
//! session-unique scratch directory. The directory is a `TempDir` guard and
//! is removed however the call ends.

use bytes::Bytes;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        request::ProcessingParams,
        upload::{DerivedOutput, Purpose, ReassembledArtifact, SessionId},
    },
    services::transcoder::{MediaTool, ToolJob},
};

/// Highest value of the encoder's constant-rate-factor scale.
const MAX_RATE: u32 = 51;
const MAX_QUALITY: u32 = 100;
const THUMBNAIL_WIDTH: u32 = 480;
/// How far before the end a clamped thumbnail offset lands.
const END_MARGIN_SECS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    Original,
    Height(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameRate {
    Original,
    Fps(f64),
}

/// A `[start, end)` range in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimRange {
    pub start: f64,
    pub end: f64,
}

impl TrimRange {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Parameters of one transcode.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeParams {
    /// Target container extension, e.g. `mp4`, `webm`, `gif`. `None` keeps
    /// the source container.
    pub format: Option<String>,
    /// 0–100; higher means better quality and a lower rate factor.
    pub quality: Option<u32>,
    pub resolution: Resolution,
    pub frame_rate: FrameRate,
    pub trim: Option<TrimRange>,
}

impl Default for TranscodeParams {
    fn default() -> Self {
        Self {
            format: None,
            quality: None,
            resolution: Resolution::Original,
            frame_rate: FrameRate::Original,
            trim: None,
        }
    }
}

impl TranscodeParams {
    /// Build the parameters a purpose needs from the client's request.
    ///
    /// Clips are stored as uploaded and need none.
    pub fn for_purpose(purpose: Purpose, raw: &ProcessingParams) -> UploadResult<Option<Self>> {
        match purpose {
            Purpose::Clip => Ok(None),
            Purpose::Compress => Ok(Some(Self {
                format: raw
                    .format
                    .as_deref()
                    .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|f| !f.is_empty()),
                quality: raw.quality,
                resolution: parse_resolution(raw.resolution.as_deref())?,
                frame_rate: parse_frame_rate(raw.fps.as_deref())?,
                trim: None,
            })),
            Purpose::Cut => {
                let start = raw.start_time.ok_or(UploadError::MissingField("startTime"))?;
                let end = raw.end_time.ok_or(UploadError::MissingField("endTime"))?;
                Ok(Some(Self {
                    trim: Some(TrimRange { start, end }),
                    ..Self::default()
                }))
            }
        }
    }

    pub fn validate(&self) -> UploadResult<()> {
        if let Some(quality) = self.quality {
            if quality > MAX_QUALITY {
                return Err(UploadError::InvalidParams(format!(
                    "quality {} is outside 0..={}",
                    quality, MAX_QUALITY
                )));
            }
        }
        if let Resolution::Height(0) = self.resolution {
            return Err(UploadError::InvalidParams("resolution must be positive".into()));
        }
        if let FrameRate::Fps(fps) = self.frame_rate {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(UploadError::InvalidParams(format!(
                    "frame rate {} must be positive",
                    fps
                )));
            }
        }
        if let Some(format) = &self.format {
            if !format.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return Err(UploadError::InvalidParams(format!(
                    "format `{}` is not a container extension",
                    format
                )));
            }
        }
        if let Some(trim) = self.trim {
            if !trim.start.is_finite() || !trim.end.is_finite() || trim.start < 0.0 {
                return Err(UploadError::InvalidParams(format!(
                    "trim start {} must be a non-negative time",
                    trim.start
                )));
            }
            if trim.end <= trim.start {
                return Err(UploadError::InvalidParams(format!(
                    "trim end {} must be after start {}",
                    trim.end, trim.start
                )));
            }
        }
        Ok(())
    }
}

fn parse_resolution(raw: Option<&str>) -> UploadResult<Resolution> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Resolution::Original),
        Some(value) if value.eq_ignore_ascii_case("original") => Ok(Resolution::Original),
        Some(value) => value
            .trim_end_matches(['p', 'P'])
            .parse::<u32>()
            .map(Resolution::Height)
            .map_err(|_| UploadError::InvalidParams(format!("unknown resolution `{}`", value))),
    }
}

fn parse_frame_rate(raw: Option<&str>) -> UploadResult<FrameRate> {
    match raw.map(str::trim) {
        None | Some("") => Ok(FrameRate::Original),
        Some(value) if value.eq_ignore_ascii_case("original") => Ok(FrameRate::Original),
        Some(value) => value
            .parse::<f64>()
            .map(FrameRate::Fps)
            .map_err(|_| UploadError::InvalidParams(format!("unknown frame rate `{}`", value))),
    }
}

/// Map a 0–100 quality onto the encoder's rate factor: `51 - quality / 2`.
pub fn rate_for_quality(quality: u32) -> u32 {
    MAX_RATE.saturating_sub(quality.min(MAX_QUALITY) / 2)
}

fn format_secs(secs: f64) -> String {
    format!("{:.3}", secs)
}

/// Tool arguments for a transcode. Trims copy streams; everything else
/// re-encodes.
pub fn transcode_job(input: PathBuf, output: PathBuf, params: &TranscodeParams) -> ToolJob {
    if let Some(trim) = params.trim {
        return ToolJob {
            pre_input: vec![
                "-ss".into(),
                format_secs(trim.start),
                "-t".into(),
                format_secs(trim.duration()),
            ],
            input,
            args: vec!["-c".into(), "copy".into()],
            output,
        };
    }

    let mut args = Vec::new();
    let mut filters = Vec::new();
    let rate = params.quality.map(rate_for_quality);

    match params.format.as_deref() {
        Some("gif") => {
            filters.push("fps=10,scale=320:-1:flags=lanczos".to_string());
        }
        Some("webm") => {
            args.extend(["-c:v".to_string(), "libvpx-vp9".to_string()]);
            if let Some(rate) = rate {
                args.extend(["-crf".into(), rate.to_string(), "-b:v".into(), "0".into()]);
            }
        }
        _ => {
            if let Some(rate) = rate {
                args.extend(["-c:v".into(), "libx264".into(), "-crf".into(), rate.to_string()]);
            }
        }
    }

    if params.format.as_deref() != Some("gif") {
        if let Resolution::Height(height) = params.resolution {
            filters.push(format!("scale=-2:{}", height));
        }
        if let FrameRate::Fps(fps) = params.frame_rate {
            args.extend(["-r".into(), fps.to_string()]);
        }
    }

    if !filters.is_empty() {
        args.extend(["-vf".into(), filters.join(",")]);
    }

    ToolJob {
        pre_input: Vec::new(),
        input,
        args,
        output,
    }
}

/// Tool arguments for a single JPEG frame at `at` seconds.
pub fn still_frame_job(input: PathBuf, output: PathBuf, at: f64) -> ToolJob {
    ToolJob {
        pre_input: vec!["-ss".into(), format_secs(at)],
        input,
        args: vec![
            "-vframes".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={}:-1", THUMBNAIL_WIDTH),
        ],
        output,
    }
}

#[derive(Clone)]
pub struct DerivativeGenerator {
    tool: Arc<dyn MediaTool>,
    scratch_root: PathBuf,
}

impl DerivativeGenerator {
    pub fn new(tool: Arc<dyn MediaTool>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            scratch_root: scratch_root.into(),
        }
    }

    /// Transcode or trim the artifact. Parameters are validated before any
    /// scratch I/O or tool invocation.
    pub async fn transcode(
        &self,
        session: &SessionId,
        artifact: &ReassembledArtifact,
        params: &TranscodeParams,
    ) -> UploadResult<DerivedOutput> {
        params.validate()?;

        let scratch = self.scratch(session).await?;
        let input = write_input(scratch.path(), artifact).await?;
        let extension = params
            .format
            .clone()
            .or_else(|| non_empty(&artifact.file_extension))
            .unwrap_or_else(|| "mp4".to_string());
        let output = scratch.path().join(format!("output.{}", extension));

        let job = transcode_job(input, output.clone(), params);
        self.tool.execute(&job).await?;

        read_output(&output, extension).await
    }

    /// Grab one frame for a thumbnail.
    ///
    /// Offsets past the end of the media are pulled back inside it; when the
    /// duration is unknown and the requested offset fails, frame zero is tried.
    pub async fn extract_still_frame(
        &self,
        session: &SessionId,
        artifact: &ReassembledArtifact,
        at: f64,
    ) -> UploadResult<DerivedOutput> {
        let scratch = self.scratch(session).await?;
        let input = write_input(scratch.path(), artifact).await?;
        let output = scratch.path().join("frame.jpg");

        let requested = if at.is_finite() { at.max(0.0) } else { 0.0 };
        let offset = match self.tool.read_duration(&input).await {
            Ok(duration) => clamp_offset(requested, duration),
            Err(err) => {
                debug!(%session, "duration probe failed, using requested offset: {}", err);
                requested
            }
        };

        let first = self
            .tool
            .execute(&still_frame_job(input.clone(), output.clone(), offset))
            .await;
        match first {
            Ok(()) => {}
            Err(err) if offset > 0.0 => {
                warn!(%session, offset, "frame extraction failed, retrying at 0: {}", err);
                self.tool
                    .execute(&still_frame_job(input, output.clone(), 0.0))
                    .await?;
            }
            Err(err) => return Err(err),
        }

        read_output(&output, "jpg".to_string()).await
    }

    /// Session-unique scratch directory, removed when the handle drops.
    async fn scratch(&self, session: &SessionId) -> UploadResult<TempDir> {
        let root = self.scratch_root.clone();
        let prefix = format!("{}-", session);
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root).map_err(|err| {
                UploadError::StorageUnavailable(format!("scratch root {}: {}", root.display(), err))
            })?;
            tempfile::Builder::new()
                .prefix(&prefix)
                .tempdir_in(&root)
                .map_err(|err| UploadError::StorageUnavailable(format!("scratch dir: {}", err)))
        })
        .await
        .map_err(|err| UploadError::StorageUnavailable(format!("scratch setup task: {}", err)))?
    }
}

fn clamp_offset(requested: f64, duration: f64) -> f64 {
    if requested < duration {
        requested
    } else {
        (duration - END_MARGIN_SECS).max(0.0)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

async fn write_input(dir: &Path, artifact: &ReassembledArtifact) -> UploadResult<PathBuf> {
    let extension = non_empty(&artifact.file_extension).unwrap_or_else(|| "bin".to_string());
    let input = dir.join(format!("input.{}", extension));
    tokio::fs::write(&input, &artifact.bytes)
        .await
        .map_err(|err| UploadError::StorageUnavailable(format!("writing scratch input: {}", err)))?;
    Ok(input)
}

async fn read_output(path: &Path, extension: String) -> UploadResult<DerivedOutput> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| UploadError::TranscodeFailed {
            diagnostic: format!("reading {}: {}", path.display(), err),
        })?;
    if bytes.is_empty() {
        return Err(UploadError::TranscodeFailed {
            diagnostic: format!("{} is empty", path.display()),
        });
    }
    let mime_type = mime_guess::from_ext(&extension)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok(DerivedOutput {
        bytes: Bytes::from(bytes),
        mime_type,
        extension,
    })
}
