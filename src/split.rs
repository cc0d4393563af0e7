//! Splits oversized local files into parts the NAS file system accepts.
//!
//! Parts are byte ranges named `<name>.partNN`. The original is only
//! removed once every part is committed and their sizes add up.

use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use futures::TryStreamExt;

use crate::atomic;
use crate::{BackupError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitReport {
    pub split: usize,
    pub parts_written: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Part file names for `path`, one per index. The part number goes last so
/// no fragment passes for a playable media file.
pub fn part_path(path: &Path, index: usize) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| BackupError::InvalidPath(path.display().to_string()))?;
    Ok(path.with_file_name(format!("{name}.part{:02}", index + 1)))
}

/// Byte ranges of `size` in chunks of at most `threshold`.
pub fn part_ranges(size: u64, threshold: u64) -> Vec<(u64, u64)> {
    let threshold = threshold.max(1);
    (0..size.div_ceil(threshold))
        .map(|i| {
            let start = i * threshold;
            (start, (start + threshold).min(size))
        })
        .collect()
}

/// Splits every file in `paths` larger than `threshold`.
pub async fn split_files(paths: &[PathBuf], threshold: u64, cancel: &CancellationToken) -> SplitReport {
    let mut report = SplitReport::default();
    for path in paths {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        match split_one(path, threshold).await {
            Ok(0) => report.skipped += 1,
            Ok(parts) => {
                tracing::info!("Split {} into {parts} parts", path.display());
                report.split += 1;
                report.parts_written += parts;
            }
            Err(e) => {
                tracing::warn!("Could not split {}: {e}", path.display());
                report.failed += 1;
            }
        }
    }
    report
}

/// Returns the number of parts written, 0 when the file is small enough.
async fn split_one(path: &Path, threshold: u64) -> Result<usize> {
    let size = tokio::fs::metadata(path).await?.len();
    if size <= threshold {
        return Ok(0);
    }

    let ranges = part_ranges(size, threshold);
    let mut written = Vec::with_capacity(ranges.len());
    let result = async {
        for (index, (start, end)) in ranges.iter().enumerate() {
            let target = part_path(path, index)?;
            let mut file = tokio::fs::File::open(path).await?;
            file.seek(std::io::SeekFrom::Start(*start)).await?;
            let stream = tokio_util::io::ReaderStream::new(file.take(end - start)).map_err(BackupError::from);
            atomic::commit_stream(&target, stream, Some(end - start), |_| {}).await?;
            written.push(target);
        }
        Ok::<(), BackupError>(())
    }
    .await;

    if let Err(e) = result {
        for part in &written {
            let _ = tokio::fs::remove_file(part).await;
        }
        return Err(e);
    }

    tokio::fs::remove_file(path).await?;
    Ok(written.len())
}
