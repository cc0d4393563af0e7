//! Per-file download: skip decision, budget check, retrying transfer,
//! atomic commit and metadata repair.

use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::atomic;
use crate::config::Settings;
use crate::metadata;
use crate::mirror::MirrorLayout;
use crate::remote::{RemoteFileDescriptor, RemoteStore};
use crate::space::{self, SpaceProbe};
use crate::verify::{self, Verdict};
use crate::{BackupError, ErrorKind, Result};

#[derive(Debug)]
pub enum FileOutcome {
    /// Fresh bytes were committed at `local`.
    Downloaded { local: PathBuf, bytes: u64 },
    /// A matching copy already sits at `local`.
    AlreadyPresent { local: PathBuf },
    /// Not enough space once the reserve is kept.
    SkippedBudget { required: u64, available: u64 },
    /// Gave up on this file; the job moves on.
    Failed(BackupError),
    /// Cancellation was observed before the next attempt started.
    Cancelled,
}

impl FileOutcome {
    /// Whether the remote original may now be archived.
    pub fn is_synced(&self) -> bool {
        matches!(self, FileOutcome::Downloaded { .. } | FileOutcome::AlreadyPresent { .. })
    }
}

pub struct DownloadEngine<'a> {
    store: &'a dyn RemoteStore,
    layout: &'a MirrorLayout,
    space: &'a dyn SpaceProbe,
    reserve: u64,
    attempts: u32,
    retry_delay: Duration,
    verify_existing: bool,
}

impl<'a> DownloadEngine<'a> {
    pub fn new(
        store: &'a dyn RemoteStore,
        layout: &'a MirrorLayout,
        space: &'a dyn SpaceProbe,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            layout,
            space,
            reserve: settings.reserve_bytes,
            attempts: settings.download_attempts.max(1),
            retry_delay: settings.download_retry_delay(),
            verify_existing: settings.verify_existing,
        }
    }

    /// Free bytes on the mirror volume right now.
    pub fn free_space(&self) -> Result<u64> {
        self.space.available_bytes(self.layout.mirror_root())
    }

    /// Brings one remote file into the mirror.
    ///
    /// `on_bytes` receives newly transferred byte counts. Bytes re-sent by a
    /// retry are not reported twice.
    pub async fn process(
        &self,
        file: &RemoteFileDescriptor,
        cancel: &CancellationToken,
        on_bytes: &mut (dyn FnMut(u64) + Send),
    ) -> FileOutcome {
        let local = self.layout.local_file(&file.path, &file.name);

        match self.existing_copy_matches(file, &local).await {
            Ok(true) => return FileOutcome::AlreadyPresent { local },
            Ok(false) => {}
            Err(e) => return FileOutcome::Failed(e),
        }

        let available = match self.free_space() {
            Ok(free) => free,
            Err(e) => return FileOutcome::Failed(e),
        };
        if !space::fits(available, self.reserve, file.size) {
            tracing::info!(
                "Skipping {}: needs {} but only {} free above the reserve",
                file.path,
                crate::format_size(file.size),
                crate::format_size(available.saturating_sub(self.reserve))
            );
            return FileOutcome::SkippedBudget { required: file.size, available };
        }

        let mut reported = 0u64;
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return FileOutcome::Cancelled;
            }
            if attempt > 1 {
                tokio::select! {
                    _ = cancel.cancelled() => return FileOutcome::Cancelled,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }

            match self.try_download(file, &local, &mut reported, on_bytes).await {
                Ok(bytes) => {
                    self.repair_metadata(file, &local).await;
                    return FileOutcome::Downloaded { local, bytes };
                }
                Err(e) if e.kind() == ErrorKind::Transient => {
                    tracing::warn!("Download of {} failed (attempt {attempt}/{}): {e}", file.path, self.attempts);
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!("Download of {} failed: {e}", file.path);
                    return FileOutcome::Failed(e);
                }
            }
        }

        FileOutcome::Failed(
            last_error.unwrap_or_else(|| BackupError::Transient(format!("{}: no attempts made", file.path))),
        )
    }

    async fn existing_copy_matches(&self, file: &RemoteFileDescriptor, local: &std::path::Path) -> Result<bool> {
        let meta = match tokio::fs::metadata(local).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Ok(false);
        }
        if meta.len() != file.size {
            // A JPEG that gained a capture time after its last download.
            return Ok(metadata::is_repaired_copy(local, &meta, file.size, file.modified_at_epoch_seconds).await);
        }
        // Same size is treated as the same file.
        if !self.verify_existing {
            return Ok(true);
        }
        match verify::local_matches_remote(self.store, local, file).await {
            Ok(Verdict::Different) => {
                tracing::info!("{} has the same size but different content; downloading again", local.display());
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Could not sample {} ({e}); trusting the size match", file.path);
                Ok(true)
            }
        }
    }

    async fn try_download(
        &self,
        file: &RemoteFileDescriptor,
        local: &std::path::Path,
        reported: &mut u64,
        on_bytes: &mut (dyn FnMut(u64) + Send),
    ) -> Result<u64> {
        let stream = self.store.download_full(&file.path).await?;
        // Size 0 in a listing means unknown, so only a known size is enforced.
        let expected = (file.size > 0).then_some(file.size);
        let mut this_attempt = 0u64;
        atomic::commit_stream(local, stream, expected, |n| {
            this_attempt += n;
            if this_attempt > *reported {
                on_bytes(this_attempt - *reported);
                *reported = this_attempt;
            }
        })
        .await
    }

    async fn repair_metadata(&self, file: &RemoteFileDescriptor, local: &std::path::Path) {
        match metadata::repair(local, file.modified_at_epoch_seconds).await {
            Ok(outcome) => tracing::debug!("Metadata for {}: {outcome:?}", local.display()),
            Err(e) => tracing::warn!("Metadata repair failed for {}: {e}", local.display()),
        }
    }
}
