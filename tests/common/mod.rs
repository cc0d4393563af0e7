//! In-memory doubles for the NAS and the cloud library.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use nas_mirror::remote::{
    file_name, is_under, join_remote, parent_path, ByteStream, ChecksumStatus, MoveStart, TaskHandle, TaskStatus,
};
use nas_mirror::space::SpaceProbe;
use nas_mirror::upload::{CloudLibrary, CommitOutcome};
use nas_mirror::{BackupError, RemoteFileDescriptor, RemoteStore, Settings};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const MTIME: i64 = 1_700_000_000;

/// How the fake server carries out a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    Inline,
    /// Returns a task that finishes after this many polls.
    Background(u32),
    /// Copies and leaves the source in place.
    CopyOnly,
    /// The task never finishes.
    Stuck,
}

struct PendingMove {
    src: String,
    dest_dir: String,
    polls_left: u32,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    move_mode: Option<MoveMode>,
    tasks: HashMap<String, PendingMove>,
    next_task: u32,
    /// Remaining mid-stream failures per path.
    broken_downloads: HashMap<String, u32>,
    /// Remaining downloads per path that end cleanly after a few bytes.
    short_downloads: HashMap<String, u32>,
    downloads: u32,
    range_requests: u32,
    moves: u32,
    deleted: Vec<String>,
}

#[derive(Default)]
pub struct FakeNas {
    state: Mutex<State>,
}

impl FakeNas {
    pub fn new() -> Self {
        let nas = Self::default();
        nas.state.lock().unwrap().dirs.insert("/".into());
        nas
    }

    fn add_dirs(state: &mut State, dir: &str) {
        let mut dir = dir.to_string();
        loop {
            let parent = parent_path(&dir).to_string();
            state.dirs.insert(dir.clone());
            if dir == "/" {
                break;
            }
            dir = parent;
        }
    }

    pub fn put(&self, path: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        Self::add_dirs(&mut state, parent_path(path));
        state.files.insert(path.to_string(), content.to_vec());
    }

    pub fn mkdir(&self, path: &str) {
        Self::add_dirs(&mut self.state.lock().unwrap(), path);
    }

    pub fn set_move_mode(&self, mode: MoveMode) {
        self.state.lock().unwrap().move_mode = Some(mode);
    }

    pub fn break_download(&self, path: &str, times: u32) {
        self.state.lock().unwrap().broken_downloads.insert(path.to_string(), times);
    }

    /// The next `times` downloads of `path` stop after five bytes without an error.
    pub fn truncate_download(&self, path: &str, times: u32) {
        self.state.lock().unwrap().short_downloads.insert(path.to_string(), times);
    }

    pub fn content_of(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    pub fn downloads(&self) -> u32 {
        self.state.lock().unwrap().downloads
    }

    pub fn range_requests(&self) -> u32 {
        self.state.lock().unwrap().range_requests
    }

    pub fn moves(&self) -> u32 {
        self.state.lock().unwrap().moves
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn apply_move(state: &mut State, src: &str, dest_dir: &str, keep_source: bool) {
        if let Some(data) = state.files.get(src).cloned() {
            Self::add_dirs(state, dest_dir);
            state.files.insert(join_remote(dest_dir, file_name(src)), data);
            if !keep_source {
                state.files.remove(src);
            }
        }
    }

    fn content(&self, path: &str) -> nas_mirror::Result<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl RemoteStore for FakeNas {
    async fn list(&self, path: &str) -> nas_mirror::Result<Vec<RemoteFileDescriptor>> {
        let state = self.state.lock().unwrap();
        if !state.dirs.contains(path) {
            return Err(BackupError::NotFound(path.to_string()));
        }
        let mut out: Vec<RemoteFileDescriptor> = state
            .dirs
            .iter()
            .filter(|d| d.as_str() != "/" && d.as_str() != path && parent_path(d) == path)
            .map(|d| RemoteFileDescriptor {
                path: d.clone(),
                name: file_name(d).to_string(),
                is_directory: true,
                size: 0,
                modified_at_epoch_seconds: Some(MTIME),
            })
            .collect();
        out.extend(state.files.iter().filter(|(p, _)| parent_path(p) == path).map(|(p, data)| {
            RemoteFileDescriptor {
                path: p.clone(),
                name: file_name(p).to_string(),
                is_directory: false,
                size: data.len() as u64,
                modified_at_epoch_seconds: Some(MTIME),
            }
        }));
        Ok(out)
    }

    async fn create_directory(&self, path: &str) -> nas_mirror::Result<()> {
        self.mkdir(path);
        Ok(())
    }

    async fn move_or_copy(&self, src: &str, dest_dir: &str) -> nas_mirror::Result<MoveStart> {
        let mut state = self.state.lock().unwrap();
        if !state.files.contains_key(src) {
            return Err(BackupError::NotFound(src.to_string()));
        }
        state.moves += 1;
        match state.move_mode.unwrap_or(MoveMode::Inline) {
            MoveMode::Inline => {
                Self::apply_move(&mut state, src, dest_dir, false);
                Ok(MoveStart::Completed)
            }
            MoveMode::CopyOnly => {
                Self::apply_move(&mut state, src, dest_dir, true);
                Ok(MoveStart::Completed)
            }
            MoveMode::Background(polls) => {
                state.next_task += 1;
                let id = format!("task-{}", state.next_task);
                state.tasks.insert(
                    id.clone(),
                    PendingMove { src: src.to_string(), dest_dir: dest_dir.to_string(), polls_left: polls },
                );
                Ok(MoveStart::Pending(TaskHandle(id)))
            }
            MoveMode::Stuck => Ok(MoveStart::Pending(TaskHandle("stuck".into()))),
        }
    }

    async fn poll_task(&self, handle: &TaskHandle) -> nas_mirror::Result<TaskStatus> {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(&handle.0) else {
            return Ok(TaskStatus { finished: false, success: false });
        };
        task.polls_left = task.polls_left.saturating_sub(1);
        if task.polls_left > 0 {
            return Ok(TaskStatus { finished: false, success: false });
        }
        let (src, dest) = (task.src.clone(), task.dest_dir.clone());
        state.tasks.remove(&handle.0);
        Self::apply_move(&mut state, &src, &dest, false);
        Ok(TaskStatus { finished: true, success: true })
    }

    async fn delete_file(&self, path: &str) -> nas_mirror::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.files.retain(|p, _| !is_under(p, path));
        state.dirs.retain(|d| !is_under(d, path));
        state.deleted.push(path.to_string());
        Ok(())
    }

    async fn start_checksum(&self, path: &str) -> nas_mirror::Result<TaskHandle> {
        self.content(path)?;
        Ok(TaskHandle(path.to_string()))
    }

    async fn poll_checksum(&self, handle: &TaskHandle) -> nas_mirror::Result<ChecksumStatus> {
        let data = self.content(&handle.0)?;
        Ok(ChecksumStatus { finished: true, digest: Some(hex::encode(Sha256::digest(&data)).to_uppercase()) })
    }

    async fn download_full(&self, path: &str) -> nas_mirror::Result<ByteStream> {
        let data = self.content(path)?;
        let (broken, short) = {
            let mut state = self.state.lock().unwrap();
            state.downloads += 1;
            (take_one(&mut state.broken_downloads, path), take_one(&mut state.short_downloads, path))
        };

        let half = data.len() / 2;
        let chunks: Vec<nas_mirror::Result<Bytes>> = if broken {
            vec![
                Ok(Bytes::copy_from_slice(&data[..half])),
                Err(BackupError::Transient("connection reset".into())),
            ]
        } else if short {
            vec![Ok(Bytes::copy_from_slice(&data[..data.len().min(5)]))]
        } else {
            vec![Ok(Bytes::copy_from_slice(&data[..half])), Ok(Bytes::copy_from_slice(&data[half..]))]
        };
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn download_range(&self, path: &str, start: u64, end: u64) -> nas_mirror::Result<Bytes> {
        let data = self.content(path)?;
        self.state.lock().unwrap().range_requests += 1;
        let end = (end as usize).min(data.len());
        let start = (start as usize).min(end);
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }
}

fn take_one(counters: &mut HashMap<String, u32>, path: &str) -> bool {
    match counters.get_mut(path) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

/// Free space that tests can change between files.
pub struct FixedSpace(pub AtomicU64);

impl FixedSpace {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }
}

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> nas_mirror::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

/// Settings rooted in `base` with every delay at zero.
pub fn test_settings(base: &Path) -> Settings {
    Settings {
        local_base: base.to_path_buf(),
        reserve_bytes: 100,
        download_retry_delay_ms: 0,
        move_poll_interval_ms: 0,
        move_poll_attempts: 5,
        verify_delay_ms: 0,
        checksum_poll_interval_ms: 0,
        ledger_path: base.join("ledger.json"),
        ..Settings::default()
    }
}

/// Minimal JPEG without EXIF: SOI, JFIF APP0, SOS, one byte of scan data, EOI.
pub fn bare_jpeg() -> Vec<u8> {
    let mut v = vec![0xFF, 0xD8];
    v.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
    v.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
    v.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02, 0x42, 0xFF, 0xD9]);
    v
}

#[derive(Default)]
struct LibraryState {
    staged: u32,
    committed: Vec<String>,
    reject_commit: HashSet<String>,
    fail_stage: HashSet<String>,
}

/// Cloud library double. Tokens are the display name plus a counter.
#[derive(Default)]
pub struct FakeLibrary {
    state: Mutex<LibraryState>,
}

impl FakeLibrary {
    /// Commits of `name` fail as if the process died after staging.
    pub fn crash_before_commit(&self, name: &str) {
        self.state.lock().unwrap().reject_commit.insert(name.to_string());
    }

    pub fn fail_stage(&self, name: &str) {
        self.state.lock().unwrap().fail_stage.insert(name.to_string());
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.reject_commit.clear();
        state.fail_stage.clear();
    }

    pub fn staged(&self) -> u32 {
        self.state.lock().unwrap().staged
    }

    pub fn committed(&self) -> Vec<String> {
        self.state.lock().unwrap().committed.clone()
    }
}

#[async_trait]
impl CloudLibrary for FakeLibrary {
    async fn stage(&self, path: &Path, sent: Arc<AtomicU64>) -> nas_mirror::Result<String> {
        let data = tokio::fs::read(path).await?;
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let mut state = self.state.lock().unwrap();
        if state.fail_stage.contains(&name) {
            return Err(BackupError::Transient(format!("stage of {name} dropped")));
        }
        sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        state.staged += 1;
        Ok(format!("{name}#{}", state.staged))
    }

    async fn commit(&self, upload_token: &str, display_name: &str) -> nas_mirror::Result<CommitOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.reject_commit.contains(display_name) {
            return Err(BackupError::Transient("process died before commit".into()));
        }
        state.committed.push(display_name.to_string());
        Ok(CommitOutcome {
            success: true,
            item_id: Some(format!("item-{upload_token}")),
            message: "Success".into(),
        })
    }
}
