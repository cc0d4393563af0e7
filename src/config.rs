//! Engine settings.
//!
//! Every field has a default so a settings file only needs to name what it
//! changes. Durations are stored as whole seconds or milliseconds to keep the
//! JSON readable.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{BackupError, Result};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Free space that is never handed out to downloads.
pub const DEFAULT_RESERVE_BYTES: u64 = 10 * GIB;

/// Largest single file the NAS share accepts (9.1 GiB).
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 9 * GIB + GIB / 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Local directory that holds the mirror directory.
    pub local_base: PathBuf,
    /// Name of the mirror directory under `local_base`.
    pub mirror_dir: String,
    /// Remote roots stripped when mapping a remote path into the mirror.
    pub source_prefixes: Vec<String>,
    /// Remote directory tree that receives archived originals.
    pub archive_root: String,
    pub reserve_bytes: u64,

    pub download_attempts: u32,
    pub download_retry_delay_ms: u64,

    pub move_poll_interval_ms: u64,
    pub move_poll_attempts: u32,
    pub verify_attempts: u32,
    pub verify_delay_ms: u64,

    pub checksum_poll_interval_ms: u64,
    pub checksum_poll_attempts: u32,

    /// Compare head/tail bytes before trusting a same-size local copy.
    pub verify_existing: bool,
    pub split_threshold: u64,
    pub ledger_path: PathBuf,
    pub photos_api_base: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_base: PathBuf::from("."),
            mirror_dir: "nas".to_string(),
            source_prefixes: vec!["/photo".to_string(), "/video".to_string()],
            archive_root: "/archive".to_string(),
            reserve_bytes: DEFAULT_RESERVE_BYTES,
            download_attempts: 3,
            download_retry_delay_ms: 3_000,
            move_poll_interval_ms: 1_000,
            move_poll_attempts: 60,
            verify_attempts: 2,
            verify_delay_ms: 1_000,
            checksum_poll_interval_ms: 1_000,
            checksum_poll_attempts: 30,
            verify_existing: false,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            ledger_path: PathBuf::from("uploaded-ledger.json"),
            photos_api_base: "https://photoslibrary.googleapis.com".to_string(),
        }
    }
}

impl Settings {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mirror_dir.is_empty() || self.mirror_dir.contains(['/', '\\']) {
            return Err(BackupError::Config(format!(
                "mirror_dir must be a single path component, got {:?}",
                self.mirror_dir
            )));
        }
        if !self.archive_root.starts_with('/') {
            return Err(BackupError::Config(format!(
                "archive_root must be absolute, got {:?}",
                self.archive_root
            )));
        }
        if self.download_attempts == 0 {
            return Err(BackupError::Config("download_attempts must be at least 1".into()));
        }
        if self.split_threshold == 0 {
            return Err(BackupError::Config("split_threshold must be positive".into()));
        }
        Ok(())
    }

    pub fn mirror_root(&self) -> PathBuf {
        self.local_base.join(&self.mirror_dir)
    }

    pub fn download_retry_delay(&self) -> Duration {
        Duration::from_millis(self.download_retry_delay_ms)
    }

    pub fn move_poll_interval(&self) -> Duration {
        Duration::from_millis(self.move_poll_interval_ms)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn checksum_poll_interval(&self) -> Duration {
        Duration::from_millis(self.checksum_poll_interval_ms)
    }
}
