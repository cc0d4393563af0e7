//! Contract between the engine and the remote file server.
//!
//! The engine never talks HTTP directly. Everything it needs from the NAS
//! goes through [`RemoteStore`], which keeps the transfer logic testable with
//! an in-memory store and lets the wire client stay a thin adapter.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::VecDeque;

use crate::Result;

/// One entry of a remote listing. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileDescriptor {
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    /// Bytes, 0 when the server did not report a size.
    pub size: u64,
    pub modified_at_epoch_seconds: Option<i64>,
}

impl RemoteFileDescriptor {
    /// Remote directory containing this entry.
    pub fn parent(&self) -> &str {
        parent_path(&self.path)
    }
}

/// Opaque id of a long-running remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub String);

/// Result of asking the server to move a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveStart {
    /// The move completed inline.
    Completed,
    /// The move runs in the background and must be polled.
    Pending(TaskHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatus {
    pub finished: bool,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumStatus {
    pub finished: bool,
    pub digest: Option<String>,
}

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, path: &str) -> Result<Vec<RemoteFileDescriptor>>;

    /// Idempotent: succeeds when the directory already exists.
    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn move_or_copy(&self, src: &str, dest_dir: &str) -> Result<MoveStart>;

    async fn poll_task(&self, handle: &TaskHandle) -> Result<TaskStatus>;

    /// Deletes a file, or a directory with everything below it.
    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn start_checksum(&self, path: &str) -> Result<TaskHandle>;

    async fn poll_checksum(&self, handle: &TaskHandle) -> Result<ChecksumStatus>;

    async fn download_full(&self, path: &str) -> Result<ByteStream>;

    /// Bytes `start..end` of the file (`end` exclusive).
    async fn download_range(&self, path: &str, start: u64, end: u64) -> Result<Bytes>;

    /// Breadth-first walk below `root`, returning every file found.
    ///
    /// `on_dir_entered` fires once per directory before it is listed. A
    /// subtree that fails to list is logged and skipped so one unreadable
    /// folder does not hide the rest of the share.
    async fn list_recursive(
        &self,
        root: &str,
        on_dir_entered: &mut (dyn for<'p> FnMut(&'p str) + Send),
    ) -> Result<Vec<RemoteFileDescriptor>> {
        let mut files = Vec::new();
        let mut queue = VecDeque::from([root.to_string()]);
        let mut first = true;

        while let Some(dir) = queue.pop_front() {
            on_dir_entered(&dir);
            match self.list(&dir).await {
                Ok(items) => {
                    for item in items {
                        if item.is_directory {
                            queue.push_back(item.path);
                        } else {
                            files.push(item);
                        }
                    }
                }
                // The root itself must be readable, otherwise there is no job.
                Err(e) if first => return Err(e),
                Err(e) => tracing::warn!("Skipping unreadable folder {dir}: {e}"),
            }
            first = false;
        }

        Ok(files)
    }
}

/// Joins a remote directory and a child name with exactly one slash.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir == "/" || dir.is_empty() {
        format!("/{}", name.trim_start_matches('/'))
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
    }
}

/// Parent of a remote path; `/` for top-level entries.
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Last component of a remote path.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// True when `path` is `root` or lies below it, compared by whole components.
pub fn is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return path.starts_with('/');
    }
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}
