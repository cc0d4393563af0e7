//! Post-job tidying of the local mirror and the remote source tree.
//!
//! Remote directories are only removed when everything left in them is on the
//! junk list. A single unknown file keeps the whole directory.

use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::atomic;
use crate::remote::{is_under, parent_path, RemoteStore};
use crate::{BackupError, ErrorKind, Result};

/// System subdirectory the NAS creates for thumbnails; never blocks removal.
pub const IGNORABLE_SUBDIR: &str = "@eaDir";

const JUNK_NAMES: &[&str] = &["thumbs.db", ".ds_store", "desktop.ini", "poster.jpg", "folder.jpg"];
const JUNK_EXTENSIONS: &[&str] = &["thm", "info"];

/// File names that may be deleted without asking.
pub fn is_junk(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if JUNK_NAMES.contains(&lower.as_str()) || name.starts_with("SYNOFILE_THUMB_") || name.starts_with("._") {
        return true;
    }
    lower
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && JUNK_EXTENSIONS.contains(&ext))
}

/// Runs a directory walk over `root` on the blocking pool.
async fn walk_blocking(root: &Path, walk: fn(&Path) -> Result<usize>) -> Result<usize> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk(&root))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
}

/// Removes empty directories below `root`, deepest first. `root` itself stays.
pub async fn prune_empty_local_dirs(root: &Path) -> Result<usize> {
    walk_blocking(root, prune_empty_dirs).await
}

fn prune_empty_dirs(root: &Path) -> Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping during local cleanup: {e}");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let empty = std::fs::read_dir(entry.path())?.next().is_none();
        if empty {
            std::fs::remove_dir(entry.path())?;
            tracing::debug!("Removed empty folder {}", entry.path().display());
            removed += 1;
        }
    }
    Ok(removed)
}

/// Deals with temp and backup siblings left by an interrupted commit.
///
/// A temp file is always incomplete and is deleted. A backup whose target is
/// missing is the only copy and is renamed back; otherwise it is deleted.
pub async fn recover_commit_artifacts(root: &Path) -> Result<usize> {
    walk_blocking(root, recover_artifacts).await
}

fn recover_artifacts(root: &Path) -> Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut handled = 0;
    let entries: Vec<_> = WalkDir::new(root).into_iter().filter_map(|e| e.ok()).collect();
    for entry in entries {
        let Some(name) = entry.file_name().to_str() else { continue };
        if !entry.file_type().is_file() || !atomic::is_commit_artifact(name) {
            continue;
        }
        let path = entry.path();
        match backup_target(name) {
            Some(original) if !path.with_file_name(original).exists() => {
                tracing::warn!("Restoring {} from interrupted commit", original);
                std::fs::rename(path, path.with_file_name(original))?;
            }
            _ => std::fs::remove_file(path)?,
        }
        handled += 1;
    }
    Ok(handled)
}

/// Original file name for a `.{name}.{id}.bak` sibling.
fn backup_target(artifact: &str) -> Option<&str> {
    let inner = artifact.strip_prefix('.')?.strip_suffix(".bak")?;
    let (name, _id) = inner.rsplit_once('.')?;
    (!name.is_empty()).then_some(name)
}

/// Every directory from each file's parent up to and including `source_root`,
/// deepest first.
pub fn ancestors_to_clean<'a>(files: impl IntoIterator<Item = &'a str>, source_root: &str) -> Vec<String> {
    let root = source_root.trim_end_matches('/');
    let mut dirs = BTreeSet::new();
    for file in files {
        let mut dir = parent_path(file);
        while is_under(dir, root) {
            if !dirs.insert(dir.to_string()) {
                break;
            }
            if dir == root {
                break;
            }
            dir = parent_path(dir);
        }
    }
    let mut dirs: Vec<String> = dirs.into_iter().collect();
    dirs.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    dirs
}

/// Deletes junk and then empty directories among `dirs`, in the given order.
///
/// Paths in `protected` (share roots) are tidied but never removed.
/// Returns the number of directories deleted.
pub async fn clean_remote_dirs(store: &dyn RemoteStore, dirs: &[String], protected: &[String]) -> usize {
    let mut removed = 0;
    for dir in dirs {
        match clean_remote_dir(store, dir, protected).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!("Cleanup of {dir} failed: {e}"),
        }
    }
    removed
}

async fn clean_remote_dir(store: &dyn RemoteStore, dir: &str, protected: &[String]) -> Result<bool> {
    let entries = match store.list(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let mut keep = false;
    for entry in &entries {
        if entry.is_directory {
            if entry.name != IGNORABLE_SUBDIR {
                keep = true;
            }
        } else if is_junk(&entry.name) {
            if let Err(e) = store.delete_file(&entry.path).await {
                tracing::warn!("Could not delete junk {}: {e}", entry.path);
                keep = true;
            }
        } else {
            keep = true;
        }
    }

    let is_protected = dir.matches('/').count() <= 1
        || protected.iter().any(|p| p.trim_end_matches('/') == dir.trim_end_matches('/'));
    if keep || is_protected {
        return Ok(false);
    }

    store.delete_file(dir).await?;
    tracing::info!("Removed empty remote folder {dir}");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn junk_list() {
        for name in ["Thumbs.db", ".DS_Store", "desktop.ini", "clip.THM", "a.thm", "poster.jpg", "x.info", "SYNOFILE_THUMB_M.jpg", "._a.jpg"] {
            assert!(is_junk(name), "{name}");
        }
        for name in ["a.jpg", "notes.txt", "info", "poster.png"] {
            assert!(!is_junk(name), "{name}");
        }
    }

    #[test]
    fn ancestors_are_deepest_first_and_bounded() {
        let dirs = ancestors_to_clean(
            ["/photo/Trip/day1/a.jpg", "/photo/Trip/b.jpg", "/photo/Trip/day2/c.jpg"],
            "/photo/Trip",
        );
        assert_eq!(dirs, vec!["/photo/Trip/day1", "/photo/Trip/day2", "/photo/Trip"]);
    }

    #[tokio::test]
    async fn prune_keeps_root_and_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::create_dir_all(dir.path().join("keep")).unwrap();
        std::fs::write(dir.path().join("keep/x.jpg"), b"x").unwrap();

        assert_eq!(prune_empty_local_dirs(dir.path()).await.unwrap(), 3);
        assert!(dir.path().exists());
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("keep/x.jpg").exists());
    }

    #[tokio::test]
    async fn interrupted_commit_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".a.jpg.0123456789ab.bak"), b"only copy").unwrap();
        std::fs::write(dir.path().join(".b.jpg.0123456789ab.part"), b"half").unwrap();
        std::fs::write(dir.path().join("c.jpg"), b"new").unwrap();
        std::fs::write(dir.path().join(".c.jpg.0123456789ab.bak"), b"old").unwrap();

        assert_eq!(recover_commit_artifacts(dir.path()).await.unwrap(), 3);
        assert_eq!(std::fs::read(dir.path().join("a.jpg")).unwrap(), b"only copy");
        assert_eq!(std::fs::read(dir.path().join("c.jpg")).unwrap(), b"new");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
