//! External transcoding collaborator (ffmpeg / ffprobe).

use async_trait::async_trait;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::process::Command;

use crate::errors::{UploadError, UploadResult};

/// Keep diagnostics readable in responses and logs.
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

/// One invocation of the transcoder: `-y [pre_input] -i input [args] output`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolJob {
    /// Options that must precede `-i` (input seeking).
    pub pre_input: Vec<String>,
    pub input: PathBuf,
    pub args: Vec<String>,
    pub output: PathBuf,
}

impl ToolJob {
    pub fn command_line(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = vec!["-y".into()];
        argv.extend(self.pre_input.iter().map(OsString::from));
        argv.push("-i".into());
        argv.push(self.input.clone().into_os_string());
        argv.extend(self.args.iter().map(OsString::from));
        argv.push(self.output.clone().into_os_string());
        argv
    }
}

/// Abstraction over the media tool so tests can stand in for ffmpeg.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Run the job to completion and leave a non-empty file at `job.output`.
    ///
    /// # Errors
    /// - `UploadError::TranscodeFailed` - tool missing, non-zero exit, or no output
    /// - `UploadError::Timeout` - the wall-clock budget ran out; the process is killed
    async fn execute(&self, job: &ToolJob) -> UploadResult<()>;

    /// Media duration in seconds.
    async fn read_duration(&self, input: &Path) -> UploadResult<f64>;
}

/// Runs the ffmpeg and ffprobe binaries as child processes.
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    budget: Duration,
}

impl FfmpegTool {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>, budget: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            budget,
        }
    }

    /// Spawn `program`, wait at most `budget`, and return its stdout.
    async fn run(&self, program: &Path, argv: Vec<OsString>) -> UploadResult<Vec<u8>> {
        let child = Command::new(program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| UploadError::TranscodeFailed {
                diagnostic: format!("could not start {}: {}", program.display(), err),
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.budget, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| UploadError::TranscodeFailed {
                diagnostic: format!("waiting for {}: {}", program.display(), err),
            })?,
            Err(_) => {
                tracing::warn!(
                    "{} exceeded {:?}; process killed",
                    program.display(),
                    self.budget
                );
                return Err(UploadError::Timeout(self.budget));
            }
        };

        if !output.status.success() {
            return Err(UploadError::TranscodeFailed {
                diagnostic: format!(
                    "{} exited with {}: {}",
                    program.display(),
                    output.status,
                    tail(&String::from_utf8_lossy(&output.stderr))
                ),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn execute(&self, job: &ToolJob) -> UploadResult<()> {
        let start_time = Instant::now();
        tracing::info!(
            "Starting ffmpeg: {} -> {}",
            job.input.display(),
            job.output.display()
        );
        tracing::debug!("ffmpeg job: {:?}", job);

        self.run(&self.ffmpeg, job.command_line()).await?;

        match tokio::fs::metadata(&job.output).await {
            Ok(meta) if meta.len() > 0 => {
                tracing::info!(
                    "ffmpeg finished in {:.2}s, output {} bytes",
                    start_time.elapsed().as_secs_f64(),
                    meta.len()
                );
                Ok(())
            }
            Ok(_) => Err(UploadError::TranscodeFailed {
                diagnostic: "ffmpeg produced an empty output file".into(),
            }),
            Err(err) => Err(UploadError::TranscodeFailed {
                diagnostic: format!("ffmpeg produced no output file: {}", err),
            }),
        }
    }

    async fn read_duration(&self, input: &Path) -> UploadResult<f64> {
        let argv: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            input.as_os_str().to_owned(),
        ];
        let stdout = self.run(&self.ffprobe, argv).await?;
        let text = String::from_utf8_lossy(&stdout);
        text.trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .ok_or_else(|| UploadError::TranscodeFailed {
                diagnostic: format!("ffprobe reported an unusable duration `{}`", text.trim()),
            })
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= MAX_DIAGNOSTIC_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - MAX_DIAGNOSTIC_CHARS).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_places_seek_before_input() {
        let job = ToolJob {
            pre_input: vec!["-ss".into(), "1.5".into()],
            input: PathBuf::from("/s/input.mp4"),
            args: vec!["-c".into(), "copy".into()],
            output: PathBuf::from("/s/output.mp4"),
        };
        let argv: Vec<String> = job
            .command_line()
            .into_iter()
            .map(|s| s.into_string().unwrap())
            .collect();
        assert_eq!(
            argv,
            vec!["-y", "-ss", "1.5", "-i", "/s/input.mp4", "-c", "copy", "/s/output.mp4"]
        );
    }

    #[test]
    fn diagnostics_keep_the_end_of_stderr() {
        let long = format!("{}END", "x".repeat(5000));
        let kept = tail(&long);
        assert_eq!(kept.chars().count(), MAX_DIAGNOSTIC_CHARS);
        assert!(kept.ends_with("END"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_transcode_failure() {
        let tool = FfmpegTool::new(
            "/nonexistent/ffmpeg-binary",
            "/nonexistent/ffprobe-binary",
            Duration::from_secs(5),
        );
        let err = tool
            .read_duration(Path::new("/tmp/whatever.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TranscodeFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_process_times_out() {
        let tool = FfmpegTool::new("sleep", "sleep", Duration::from_millis(100));
        let err = tool
            .run(Path::new("sleep"), vec!["5".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Timeout(_)));
    }
}
