use anyhow::{Context, Result, ensure};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::models::{job::Cadence, upload::DEFAULT_MAX_CHUNKS};

/// Ten years. Keeps `created_at + expiry` inside chrono's range.
const MAX_EXPIRY_HOURS: i64 = 87_600;

/// Centralized application configuration.
/// CLI arguments override `CLIPIT_*` environment variables, which override defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub database_url: String,
    pub public_base_url: String,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub transcode_timeout_secs: u64,
    pub expiry_hours: i64,
    pub cleanup_interval_secs: u64,
    /// Cron cadence for the expiry sweep; replaces the interval when set.
    pub cleanup_cron: Option<String>,
    pub max_body_bytes: usize,
    /// Most chunks one session may declare or store.
    pub max_chunks: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked upload and finalization service")]
pub struct Args {
    /// Host to bind to (overrides CLIPIT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CLIPIT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides CLIPIT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Directory for transcoder scratch files (overrides CLIPIT_SCRATCH_DIR)
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Database URL (overrides CLIPIT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base of the public file URLs (overrides CLIPIT_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// ffmpeg binary (overrides CLIPIT_FFMPEG_PATH)
    #[arg(long)]
    pub ffmpeg_path: Option<PathBuf>,

    /// ffprobe binary (overrides CLIPIT_FFPROBE_PATH)
    #[arg(long)]
    pub ffprobe_path: Option<PathBuf>,

    /// Wall-clock budget per transcoder run (overrides CLIPIT_TRANSCODE_TIMEOUT_SECS)
    #[arg(long)]
    pub transcode_timeout_secs: Option<u64>,

    /// Lifetime of compressions and cuts (overrides CLIPIT_EXPIRY_HOURS)
    #[arg(long)]
    pub expiry_hours: Option<i64>,

    /// Seconds between expiry sweeps (overrides CLIPIT_CLEANUP_INTERVAL_SECS)
    #[arg(long)]
    pub cleanup_interval_secs: Option<u64>,

    /// Cron expression for expiry sweeps (overrides CLIPIT_CLEANUP_CRON)
    #[arg(long)]
    pub cleanup_cron: Option<String>,

    /// Largest accepted request body (overrides CLIPIT_MAX_BODY_BYTES)
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Most chunks per upload session (overrides CLIPIT_MAX_CHUNKS)
    #[arg(long)]
    pub max_chunks: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |name| env::var(name))?, migrate))
    }

    /// Merge parsed arguments over an environment lookup.
    pub fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|_| default.into());

        let expiry_hours = pick(args.expiry_hours, &lookup, "CLIPIT_EXPIRY_HOURS", 6)?;
        ensure!(
            (1..=MAX_EXPIRY_HOURS).contains(&expiry_hours),
            "CLIPIT_EXPIRY_HOURS must be between 1 and {}, got {}",
            MAX_EXPIRY_HOURS,
            expiry_hours
        );
        let max_chunks = pick(args.max_chunks, &lookup, "CLIPIT_MAX_CHUNKS", DEFAULT_MAX_CHUNKS)?;
        ensure!(max_chunks >= 1, "CLIPIT_MAX_CHUNKS must be at least 1");
        let cleanup_cron = args
            .cleanup_cron
            .or_else(|| lookup("CLIPIT_CLEANUP_CRON").ok())
            .filter(|expr| !expr.trim().is_empty());
        if let Some(expr) = &cleanup_cron {
            Cadence::cron(expr).context("parsing CLIPIT_CLEANUP_CRON")?;
        }

        Ok(Self {
            host: args.host.unwrap_or_else(|| text("CLIPIT_HOST", "0.0.0.0")),
            port: pick(args.port, &lookup, "CLIPIT_PORT", 3000)?,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| text("CLIPIT_STORAGE_DIR", "./data/blobs").into()),
            scratch_dir: args
                .scratch_dir
                .unwrap_or_else(|| text("CLIPIT_SCRATCH_DIR", "./data/scratch").into()),
            database_url: args
                .database_url
                .unwrap_or_else(|| text("CLIPIT_DATABASE_URL", "sqlite://./data/meta/clipit.db")),
            public_base_url: args
                .public_base_url
                .unwrap_or_else(|| text("CLIPIT_PUBLIC_BASE_URL", "http://localhost:3000")),
            ffmpeg_path: args
                .ffmpeg_path
                .unwrap_or_else(|| text("CLIPIT_FFMPEG_PATH", "ffmpeg").into()),
            ffprobe_path: args
                .ffprobe_path
                .unwrap_or_else(|| text("CLIPIT_FFPROBE_PATH", "ffprobe").into()),
            transcode_timeout_secs: pick(
                args.transcode_timeout_secs,
                &lookup,
                "CLIPIT_TRANSCODE_TIMEOUT_SECS",
                120,
            )?,
            expiry_hours,
            cleanup_interval_secs: pick(
                args.cleanup_interval_secs,
                &lookup,
                "CLIPIT_CLEANUP_INTERVAL_SECS",
                86_400,
            )?,
            cleanup_cron,
            max_body_bytes: pick(
                args.max_body_bytes,
                &lookup,
                "CLIPIT_MAX_BODY_BYTES",
                256 * 1024 * 1024,
            )?,
            max_chunks,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }

    pub fn cleanup_cadence(&self) -> Cadence {
        self.cleanup_cron
            .as_deref()
            .and_then(|expr| Cadence::cron(expr).ok())
            .unwrap_or_else(|| Cadence::every(self.cleanup_interval_secs))
    }

    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.expiry_hours.clamp(1, MAX_EXPIRY_HOURS))
    }
}

/// CLI value, else a parsed env value, else `default`.
fn pick<T, F>(cli: Option<T>, lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match lookup(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
