//! Mapping between the remote tree, the local mirror and the remote archive.
//!
//! All functions here are pure. The download engine and the cleanup pass
//! derive the same directory for the same remote file independently, so the
//! mapping must never depend on state.

use std::path::{Path, PathBuf};

use crate::remote::{is_under, join_remote, parent_path};

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "heic", "heif", "webp", "bmp", "tif", "tiff", "dng", "raw",
    "cr2", "cr3", "nef", "arw", "orf", "rw2",
];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "3gp", "mkv", "avi", "mts", "m2ts", "wmv", "webm", "mpg", "mpeg",
];

fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_image(name: &str) -> bool {
    extension_of(name).is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

pub fn is_video(name: &str) -> bool {
    extension_of(name).is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
}

/// Media allowlist used both for remote candidates and the local upload scan.
pub fn is_media(name: &str) -> bool {
    is_image(name) || is_video(name)
}

/// Relative directory (below the mirror root) for the parent of `remote_path`.
///
/// The longest prefix matching on whole components wins. A path outside every
/// prefix maps flat onto the mirror root, which is the empty relative path.
pub fn resolve(remote_path: &str, prefixes: &[String]) -> PathBuf {
    let parent = parent_path(remote_path);
    let best = prefixes
        .iter()
        .map(|p| p.trim_end_matches('/'))
        .filter(|p| !p.is_empty() && is_under(parent, p))
        .max_by_key(|p| p.len());

    let Some(prefix) = best else {
        return PathBuf::new();
    };

    parent[prefix.len()..]
        .split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .collect()
}

/// Where mirrored files live locally and archived files live remotely.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    mirror_root: PathBuf,
    prefixes: Vec<String>,
    archive_root: String,
}

impl MirrorLayout {
    pub fn new(mirror_root: impl Into<PathBuf>, prefixes: Vec<String>, archive_root: impl Into<String>) -> Self {
        Self {
            mirror_root: mirror_root.into(),
            prefixes,
            archive_root: archive_root.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_settings(settings: &crate::Settings) -> Self {
        Self::new(
            settings.mirror_root(),
            settings.source_prefixes.clone(),
            settings.archive_root.clone(),
        )
    }

    pub fn mirror_root(&self) -> &Path {
        &self.mirror_root
    }

    pub fn archive_root(&self) -> &str {
        &self.archive_root
    }

    /// Local directory that mirrors the parent of `remote_path`.
    pub fn local_dir(&self, remote_path: &str) -> PathBuf {
        self.mirror_root.join(resolve(remote_path, &self.prefixes))
    }

    /// Local file path for `remote_path`.
    pub fn local_file(&self, remote_path: &str, name: &str) -> PathBuf {
        self.local_dir(remote_path).join(name)
    }

    /// Remote archive directory for `remote_path`, mirroring its subtree.
    pub fn archive_dir(&self, remote_path: &str) -> String {
        let relative = resolve(remote_path, &self.prefixes);
        relative
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .fold(self.archive_root.clone(), |acc, c| join_remote(&acc, c))
    }

    pub fn is_archived(&self, remote_path: &str) -> bool {
        is_under(remote_path, &self.archive_root)
    }
}
