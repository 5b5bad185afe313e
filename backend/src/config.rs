//! Runtime configuration read from `IMPORT_*` environment variables.
//!
//! Every value has a default so the server starts with no environment at all.
//! A value that fails to parse is reported with a warning and replaced by its
//! default rather than aborting startup.

use log::warn;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DB_PATH: &str = "subscribers.sqlite";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_CHECKPOINT_EVERY: usize = 200;
const DEFAULT_PAUSE_POLL_MS: u64 = 500;
const DEFAULT_PAUSE_IDLE_SECS: u64 = 1800;
const DEFAULT_ARCHIVE_KEEP: usize = 3;
const DEFAULT_MAX_UPLOAD_MB: u64 = 512;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub import: ImportSettings,
}

/// Knobs handed to every import worker.
#[derive(Clone, Debug)]
pub struct ImportSettings {
    /// Logical rows per committed batch; control flags are re-read and the
    /// heartbeat written once per batch.
    pub checkpoint_every: usize,
    pub pause_poll_interval: Duration,
    /// A paused worker gives its thread back after this long. The job stays
    /// `paused` and a later resume restarts it from the checkpoint.
    pub pause_idle_timeout: Duration,
    pub archive_keep: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            pause_poll_interval: Duration::from_millis(DEFAULT_PAUSE_POLL_MS),
            pause_idle_timeout: Duration::from_secs(DEFAULT_PAUSE_IDLE_SECS),
            archive_keep: DEFAULT_ARCHIVE_KEEP,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let checkpoint_every: usize =
            parse_or(&lookup, "IMPORT_CHECKPOINT_EVERY", DEFAULT_CHECKPOINT_EVERY);
        Self {
            host: lookup("IMPORT_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(&lookup, "IMPORT_PORT", DEFAULT_PORT),
            db_path: lookup("IMPORT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            upload_dir: lookup("IMPORT_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            max_upload_bytes: parse_or(&lookup, "IMPORT_MAX_UPLOAD_MB", DEFAULT_MAX_UPLOAD_MB)
                .saturating_mul(1024 * 1024),
            import: ImportSettings {
                checkpoint_every: checkpoint_every.max(1),
                pause_poll_interval: Duration::from_millis(parse_or(
                    &lookup,
                    "IMPORT_PAUSE_POLL_MS",
                    DEFAULT_PAUSE_POLL_MS,
                )),
                pause_idle_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "IMPORT_PAUSE_IDLE_SECS",
                    DEFAULT_PAUSE_IDLE_SECS,
                )),
                archive_keep: parse_or(&lookup, "IMPORT_ARCHIVE_KEEP", DEFAULT_ARCHIVE_KEEP),
            },
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}='{}', using {}", key, raw, default);
            default
        }),
        None => default,
    }
}
