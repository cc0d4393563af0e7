//! Jobs and the pending-job queue.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::PathBuf;

use crate::remote::RemoteFileDescriptor;

#[derive(Debug, Clone)]
pub enum Job {
    /// Everything below `source_path`.
    RecursiveBackup { source_path: String, archive_after_transfer: bool },
    /// An explicit set of files below `source_path`.
    SelectedBackup {
        files: Vec<RemoteFileDescriptor>,
        source_path: String,
        archive_after_transfer: bool,
    },
    /// Local maintenance: split oversized files into NAS-safe parts.
    SplitFiles { paths: Vec<PathBuf> },
}

/// Short digest of a path set, independent of the order it was given in.
fn digest_of<I: IntoIterator<Item = String>>(items: I) -> String {
    let mut items: Vec<String> = items.into_iter().collect();
    items.sort();
    items.dedup();
    let mut hasher = Sha256::new();
    for item in &items {
        hasher.update(item.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}

impl Job {
    pub fn source_path(&self) -> Option<&str> {
        match self {
            Job::RecursiveBackup { source_path, .. } | Job::SelectedBackup { source_path, .. } => {
                Some(source_path)
            }
            Job::SplitFiles { .. } => None,
        }
    }

    pub fn archive_after_transfer(&self) -> bool {
        match self {
            Job::RecursiveBackup { archive_after_transfer, .. }
            | Job::SelectedBackup { archive_after_transfer, .. } => *archive_after_transfer,
            Job::SplitFiles { .. } => false,
        }
    }

    /// Stable identity used to refuse duplicate enqueues.
    pub fn label(&self) -> String {
        let archive = |flag: bool| if flag { "+archive" } else { "" };
        match self {
            Job::RecursiveBackup { source_path, archive_after_transfer } => {
                format!("backup:{}{}", source_path.trim_end_matches('/'), archive(*archive_after_transfer))
            }
            Job::SelectedBackup { files, source_path, archive_after_transfer } => format!(
                "selected:{}{}:{}",
                source_path.trim_end_matches('/'),
                archive(*archive_after_transfer),
                digest_of(files.iter().map(|f| f.path.clone()))
            ),
            Job::SplitFiles { paths } => format!(
                "split:{}",
                digest_of(paths.iter().map(|p| p.to_string_lossy().into_owned()))
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyQueued,
}

/// Pending jobs plus the one currently running.
#[derive(Debug, Default)]
pub struct JobQueue {
    pending: VecDeque<Job>,
    active: Option<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job: Job) -> EnqueueOutcome {
        let label = job.label();
        let duplicate = self.active.as_ref().is_some_and(|a| a.label() == label)
            || self.pending.iter().any(|p| p.label() == label);
        if duplicate {
            return EnqueueOutcome::AlreadyQueued;
        }
        self.pending.push_back(job);
        EnqueueOutcome::Queued
    }

    /// Moves the head of the queue into the active slot.
    ///
    /// Returns `None` while another job is still active.
    pub fn pop_next(&mut self) -> Option<Job> {
        if self.active.is_some() {
            return None;
        }
        let job = self.pending.pop_front()?;
        self.active = Some(job.clone());
        Some(job)
    }

    /// Clears the active slot once its processing loop has exited.
    pub fn finish_active(&mut self) -> Option<Job> {
        self.active.take()
    }

    /// Drops every pending job, returning how many were removed.
    pub fn clear_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn active(&self) -> Option<&Job> {
        self.active.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.pending.iter().map(Job::label).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> RemoteFileDescriptor {
        RemoteFileDescriptor {
            path: path.to_string(),
            name: crate::remote::file_name(path).to_string(),
            is_directory: false,
            size: 1,
            modified_at_epoch_seconds: None,
        }
    }

    fn backup(path: &str, archive: bool) -> Job {
        Job::RecursiveBackup { source_path: path.to_string(), archive_after_transfer: archive }
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut queue = JobQueue::new();
        assert_eq!(queue.enqueue(backup("/photo/Trip", true)), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(backup("/photo/Trip/", true)), EnqueueOutcome::AlreadyQueued);
        assert_eq!(queue.enqueue(backup("/photo/Trip", false)), EnqueueOutcome::Queued);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn active_job_blocks_its_own_label() {
        let mut queue = JobQueue::new();
        queue.enqueue(backup("/photo/Trip", true));
        let job = queue.pop_next().unwrap();
        assert_eq!(queue.active().map(Job::label), Some(job.label()));
        assert_eq!(queue.enqueue(backup("/photo/Trip", true)), EnqueueOutcome::AlreadyQueued);

        queue.finish_active();
        assert_eq!(queue.enqueue(backup("/photo/Trip", true)), EnqueueOutcome::Queued);
    }

    #[test]
    fn selection_label_ignores_order() {
        let a = Job::SelectedBackup {
            files: vec![file("/photo/x/1.jpg"), file("/photo/x/2.jpg")],
            source_path: "/photo/x".into(),
            archive_after_transfer: false,
        };
        let b = Job::SelectedBackup {
            files: vec![file("/photo/x/2.jpg"), file("/photo/x/1.jpg")],
            source_path: "/photo/x".into(),
            archive_after_transfer: false,
        };
        assert_eq!(a.label(), b.label());
        assert!(a.label().starts_with("selected:/photo/x:"));
    }

    #[test]
    fn pop_is_fifo() {
        let mut queue = JobQueue::new();
        queue.enqueue(backup("/a", false));
        queue.enqueue(backup("/b", false));
        assert_eq!(queue.pop_next().unwrap().source_path(), Some("/a"));
        queue.finish_active();
        assert_eq!(queue.pop_next().unwrap().source_path(), Some("/b"));
        queue.finish_active();
        assert!(queue.pop_next().is_none());
        assert!(queue.active().is_none());
    }
}
