//! Atomic commit of downloaded bytes into the mirror.
//!
//! Bytes always land in a temporary sibling first. Only a complete temporary
//! file is moved into the final path, and an existing file is parked in a
//! backup sibling while the swap happens. At every instant the final path holds
//! either the old complete file or the new complete file.

use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::{BackupError, Result};

const TEMP_SUFFIX: &str = "part";
const BACKUP_SUFFIX: &str = "bak";

fn sibling(target: &Path, suffix: &str) -> Result<PathBuf> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BackupError::InvalidPath(target.display().to_string()))?;
    let id = uuid::Uuid::new_v4().simple().to_string();
    Ok(target.with_file_name(format!(".{name}.{}.{suffix}", &id[..12])))
}

/// True for temporary or backup siblings left behind by a hard crash.
pub fn is_commit_artifact(name: &str) -> bool {
    name.starts_with('.')
        && (name.ends_with(&format!(".{TEMP_SUFFIX}")) || name.ends_with(&format!(".{BACKUP_SUFFIX}")))
}

/// Filesystem renames, split out so tests can make them fail.
pub(crate) trait Renamer {
    fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;
}

pub(crate) struct StdRenamer;

impl Renamer for StdRenamer {
    fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        std::fs::rename(from, to)
    }
}

/// Streams `stream` into `target` and commits it atomically.
///
/// `on_chunk` sees the size of every chunk written. On any stream or write
/// error the temporary file is removed and the error is returned unchanged,
/// so the caller can decide whether to retry. With `expected` set, a stream
/// that ends at any other length is a transient failure and nothing is
/// committed.
pub async fn commit_stream<S, F>(target: &Path, mut stream: S, expected: Option<u64>, mut on_chunk: F) -> Result<u64>
where
    S: Stream<Item = Result<bytes::Bytes>> + Unpin,
    F: FnMut(u64),
{
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = sibling(target, TEMP_SUFFIX)?;

    let written = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let data = chunk?;
            file.write_all(&data).await?;
            written += data.len() as u64;
            on_chunk(data.len() as u64);
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok::<u64, BackupError>(written)
    }
    .await;

    let written = match written {
        Ok(n) if expected.map_or(true, |len| len == n) => n,
        Ok(n) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(BackupError::Transient(format!(
                "{}: stream ended after {n} of {} bytes",
                target.display(),
                expected.unwrap_or_default()
            )));
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
    };

    let owned_target = target.to_path_buf();
    tokio::task::spawn_blocking(move || replace_with(&temp, &owned_target, &StdRenamer))
        .await
        .map_err(|e| BackupError::AtomicCommit(format!("{}: commit task failed: {e}", target.display())))??;
    Ok(written)
}

/// Atomically replaces `target` with `bytes`.
pub async fn commit_bytes(target: &Path, bytes: Vec<u8>) -> Result<()> {
    let stream = futures::stream::iter([Ok(bytes::Bytes::from(bytes))]);
    commit_stream(target, stream, None, |_| {}).await.map(|_| ())
}

/// Moves a complete `temp` file into `target`.
///
/// With no file at `target` this is a single rename. Otherwise the old file
/// is parked in a backup sibling, the new one is renamed in, and the backup is
/// deleted. A failed park leaves the original untouched; a failed swap puts
/// the backup back.
pub(crate) fn replace_with(temp: &Path, target: &Path, fs: &dyn Renamer) -> Result<()> {
    if !target.exists() {
        return fs.rename(temp, target).map_err(|e| {
            let _ = std::fs::remove_file(temp);
            BackupError::AtomicCommit(format!("{}: {e}", target.display()))
        });
    }

    let backup = sibling(target, BACKUP_SUFFIX)?;
    if let Err(e) = fs.rename(target, &backup) {
        let _ = std::fs::remove_file(temp);
        return Err(BackupError::AtomicCommit(format!(
            "could not park {} ({e}); original kept",
            target.display()
        )));
    }

    if let Err(e) = fs.rename(temp, target) {
        let restored = fs.rename(&backup, target);
        let _ = std::fs::remove_file(temp);
        return Err(match restored {
            Ok(()) => BackupError::AtomicCommit(format!(
                "could not move new file into {} ({e}); original restored",
                target.display()
            )),
            Err(restore_err) => BackupError::AtomicCommit(format!(
                "could not move new file into {} ({e}) nor restore backup {} ({restore_err})",
                target.display(),
                backup.display()
            )),
        });
    }

    if let Err(e) = std::fs::remove_file(&backup) {
        tracing::warn!("Could not remove backup {}: {e}", backup.display());
    }
    Ok(())
}
