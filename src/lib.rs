//! NAS media mirror and archive engine.
//!
//! Mirrors media from a NAS share to local storage one job at a time,
//! commits every file with an atomic replace, moves the remote originals into
//! an archive tree, and re-uploads the local mirror to a cloud photo library.

pub mod atomic;
pub mod cleanup;
pub mod config;
pub mod discovery;
pub mod download;
pub mod filestation;
pub mod job;
pub mod ledger;
pub mod metadata;
pub mod mirror;
pub mod progress;
pub mod relocate;
pub mod remote;
pub mod space;
pub mod split;
pub mod task;
pub mod upload;
pub mod verify;
pub mod worker;

pub use config::Settings;
pub use filestation::FileStationClient;
pub use job::{EnqueueOutcome, Job, JobQueue};
pub use ledger::TransferLedger;
pub use mirror::MirrorLayout;
pub use progress::{StatusBoard, StatusSnapshot};
pub use remote::{RemoteFileDescriptor, RemoteStore};
pub use upload::{CloudLibrary, PhotoLibraryClient, UploadPipeline, UploadReport};
pub use verify::Verdict;
pub use worker::{JobReport, Orchestrator};

// --- ERROR HANDLING ---

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Insufficient storage: need {required} bytes, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Remote task timed out: {0}")]
    RemoteTaskTimeout(String),

    #[error("Atomic commit failed: {0}")]
    AtomicCommit(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("EXIF error: {0}")]
    Exif(#[from] exif::Error),
}

/// Coarse classification used to decide between retry, skip and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    NotFound,
    PermissionDenied,
    InsufficientStorage,
    RemoteTaskTimeout,
    AtomicCommit,
    Cancelled,
    Fatal,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Network(_) | BackupError::Io(_) | BackupError::Transient(_) => {
                ErrorKind::Transient
            }
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::PermissionDenied(_) | BackupError::NotAuthenticated => {
                ErrorKind::PermissionDenied
            }
            BackupError::InsufficientStorage { .. } => ErrorKind::InsufficientStorage,
            BackupError::RemoteTaskTimeout(_) => ErrorKind::RemoteTaskTimeout,
            BackupError::AtomicCommit(_) => ErrorKind::AtomicCommit,
            BackupError::Cancelled => ErrorKind::Cancelled,
            // Server-side hiccups come back as API errors in the 5xx family.
            BackupError::Api { code, .. } if *code >= 500 => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Renders a byte count the way the status line shows it.
pub fn format_size(size: u64) -> String {
    let mut size = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}
