//! Re-upload of the local mirror into a cloud photo library.
//!
//! Uploading is two-phase: bytes are staged for an upload token, then the
//! token is committed as a library item. Only a committed item is written to
//! the ledger, so a crash in between costs one re-stage and never a duplicate.

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::atomic;
use crate::ledger::TransferLedger;
use crate::mirror;
use crate::progress::{ProgressState, StatusBoard};
use crate::{BackupError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub success: bool,
    pub item_id: Option<String>,
    pub message: String,
}

#[async_trait]
pub trait CloudLibrary: Send + Sync {
    /// Streams the file and returns an upload token. `sent` counts bytes as
    /// they leave.
    async fn stage(&self, path: &Path, sent: Arc<AtomicU64>) -> Result<String>;

    async fn commit(&self, upload_token: &str, display_name: &str) -> Result<CommitOutcome>;
}

// --- HTTP client ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchCreateResponse {
    #[serde(default)]
    new_media_item_results: Vec<MediaItemResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItemResult {
    status: Option<ItemStatus>,
    media_item: Option<MediaItem>,
}

#[derive(Deserialize)]
struct ItemStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct MediaItem {
    id: String,
}

fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "3gp" => "video/3gpp",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mpg" | "mpeg" => "video/mpeg",
        _ => "application/octet-stream",
    }
}

/// Google Photos style library over HTTP.
#[derive(Clone)]
pub struct PhotoLibraryClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl PhotoLibraryClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    fn check_status(response: &reqwest::Response, context: &str) -> Result<()> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BackupError::NotAuthenticated);
        }
        if !status.is_success() {
            return Err(BackupError::Api { code: status.as_u16() as i64, message: format!("{context}: {status}") });
        }
        Ok(())
    }
}

#[async_trait]
impl CloudLibrary for PhotoLibraryClient {
    async fn stage(&self, path: &Path, sent: Arc<AtomicU64>) -> Result<String> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        // Stream from disk; memory stays at one chunk whatever the file size.
        let stream = tokio_util::io::ReaderStream::new(file).inspect_ok(move |chunk| {
            sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });

        let response = self
            .client
            .post(format!("{}/v1/uploads", self.base_url))
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .header("X-Goog-Upload-Content-Type", mime_type(path))
            .header("X-Goog-Upload-Protocol", "raw")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        Self::check_status(&response, "stage")?;

        let token = response.text().await?.trim().to_string();
        if token.is_empty() {
            return Err(BackupError::Api { code: -1, message: "stage returned an empty upload token".into() });
        }
        Ok(token)
    }

    async fn commit(&self, upload_token: &str, display_name: &str) -> Result<CommitOutcome> {
        let body = serde_json::json!({
            "newMediaItems": [{
                "simpleMediaItem": { "uploadToken": upload_token, "fileName": display_name }
            }]
        });
        let response = self
            .client
            .post(format!("{}/v1/mediaItems:batchCreate", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        Self::check_status(&response, "commit")?;

        let parsed: BatchCreateResponse = response.json().await?;
        let Some(result) = parsed.new_media_item_results.into_iter().next() else {
            return Ok(CommitOutcome { success: false, item_id: None, message: "empty commit response".into() });
        };
        let (code, message) = result.status.map(|s| (s.code, s.message)).unwrap_or((0, String::new()));
        let item_id = result.media_item.map(|m| m.id);
        Ok(CommitOutcome { success: code == 0 && item_id.is_some(), item_id, message })
    }
}

// --- Pipeline ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub pending: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub skipped_in_ledger: usize,
    pub cancelled: bool,
}

/// Media files under `root` in path order, commit artifacts excluded.
pub fn scan_media(root: &Path) -> Vec<(PathBuf, u64)> {
    let mut files: Vec<(PathBuf, u64)> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| mirror::is_media(n) && !atomic::is_commit_artifact(n))
        })
        .filter_map(|e| {
            let size = e.metadata().ok()?.len();
            Some((e.into_path(), size))
        })
        .collect();
    files.sort();
    files
}

pub struct UploadPipeline {
    library: Arc<dyn CloudLibrary>,
    ledger: TransferLedger,
    board: Arc<StatusBoard>,
}

impl UploadPipeline {
    pub fn new(library: Arc<dyn CloudLibrary>, ledger: TransferLedger, board: Arc<StatusBoard>) -> Self {
        Self { library, ledger, board }
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    /// Uploads every media file under `mirror_root` that the ledger lacks.
    pub async fn run(&mut self, mirror_root: &Path, cancel: &CancellationToken) -> Result<UploadReport> {
        let root = std::fs::canonicalize(mirror_root)?;
        let all = scan_media(&root);
        let mut report = UploadReport::default();

        let pending: Vec<(PathBuf, u64)> = all
            .into_iter()
            .filter(|(path, _)| {
                let known = self.ledger.contains(path);
                if known {
                    report.skipped_in_ledger += 1;
                }
                !known
            })
            .collect();
        report.pending = pending.len();
        tracing::info!("{} files to upload, {} already in the ledger", report.pending, report.skipped_in_ledger);

        let mut batch = ProgressState::new(pending.iter().map(|(_, size)| size).sum());
        self.board.clear_progress();

        for (index, (path, size)) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                self.board.set_status("Upload cancelled");
                break;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            self.board.set_status(format!("Uploading {name} ({}/{})", index + 1, report.pending));

            let credited = match self.upload_one(path, &name, *size, &mut batch).await {
                Ok((id, credited)) => {
                    match self.ledger.record(path, &id) {
                        Ok(_) => report.uploaded += 1,
                        Err(e) => {
                            // Committed but not recorded: the next run will upload it again.
                            tracing::error!("Ledger write failed for {}: {e}", path.display());
                            self.board.log(&format!("Ledger write failed for {name}: {e}"));
                            report.failed += 1;
                        }
                    }
                    credited
                }
                Err((e, credited)) => {
                    tracing::warn!("Upload of {} failed: {e}", path.display());
                    self.board.log(&format!("Upload of {name} failed: {e}"));
                    report.failed += 1;
                    credited
                }
            };
            batch.advance(size.saturating_sub(credited));
            self.board.set_progress(&batch);
        }

        self.board.set_status(format!(
            "Upload finished: {} uploaded, {} failed, {} already uploaded",
            report.uploaded, report.failed, report.skipped_in_ledger
        ));
        Ok(report)
    }

    /// Stages and commits one file. Returns the library id and the bytes
    /// already credited to `batch`.
    async fn upload_one(
        &self,
        path: &Path,
        name: &str,
        size: u64,
        batch: &mut ProgressState,
    ) -> std::result::Result<(String, u64), (BackupError, u64)> {
        let sent = Arc::new(AtomicU64::new(0));
        let mut credited = 0u64;

        let stage = self.library.stage(path, sent.clone());
        tokio::pin!(stage);
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        let staged = loop {
            tokio::select! {
                result = &mut stage => break result,
                _ = ticker.tick() => {
                    let now = sent.load(Ordering::Relaxed).min(size);
                    if now > credited {
                        batch.advance(now - credited);
                        credited = now;
                        self.board.set_progress(batch);
                        self.board.set_status(format!(
                            "Uploading {name}: {} / {}",
                            crate::format_size(now),
                            crate::format_size(size)
                        ));
                    }
                }
            }
        };
        let token = staged.map_err(|e| (e, credited))?;

        let outcome = self.library.commit(&token, name).await.map_err(|e| (e, credited))?;
        match outcome {
            CommitOutcome { success: true, item_id: Some(id), .. } => Ok((id, credited)),
            CommitOutcome { message, .. } => Err((
                BackupError::Api { code: -1, message: format!("commit rejected: {message}") },
                credited,
            )),
        }
    }
}
