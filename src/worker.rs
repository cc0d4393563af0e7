//! Single background worker that drains the job queue.
//!
//! The queue, the running flag and the active job's cancellation token live
//! behind one mutex. The worker decides to stop under that same lock, so an
//! enqueue racing with shutdown either sees the worker running or restarts it.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cleanup;
use crate::config::Settings;
use crate::download::{DownloadEngine, FileOutcome};
use crate::job::{EnqueueOutcome, Job, JobQueue};
use crate::mirror::{self, MirrorLayout};
use crate::progress::{ProgressState, StatusBoard};
use crate::relocate::{Relocation, Relocator};
use crate::remote::{RemoteFileDescriptor, RemoteStore};
use crate::space::{self, SpaceProbe};
use crate::split;
use crate::BackupError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub candidates: usize,
    pub downloaded: usize,
    pub skipped_existing: usize,
    pub skipped_budget: usize,
    pub failed: usize,
    pub relocated: usize,
    pub relocation_failed: usize,
    pub cleaned_dirs: usize,
    pub cancelled: bool,
    /// The job stopped before its first file.
    pub aborted: bool,
}

/// Media by extension, minus thumbnails and resource forks that share it.
fn is_candidate(name: &str) -> bool {
    mirror::is_media(name) && !cleanup::is_junk(name)
}

#[derive(Default)]
struct QueueState {
    queue: JobQueue,
    worker_running: bool,
    cancel: Option<CancellationToken>,
    finished: Vec<(String, JobReport)>,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    space: Arc<dyn SpaceProbe>,
    settings: Settings,
    layout: MirrorLayout,
    board: Arc<StatusBoard>,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        space: Arc<dyn SpaceProbe>,
        settings: Settings,
        board: Arc<StatusBoard>,
    ) -> Self {
        let layout = MirrorLayout::from_settings(&settings);
        Self {
            inner: Arc::new(Inner { store, space, settings, layout, board, state: Mutex::new(QueueState::default()) }),
        }
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.inner.board
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.inner.layout
    }

    pub fn enqueue(&self, job: Job) -> EnqueueOutcome {
        let label = job.label();
        let outcome = {
            let mut state = self.inner.lock();
            let outcome = state.queue.enqueue(job);
            self.inner.publish_queue(&state);
            outcome
        };
        match outcome {
            EnqueueOutcome::Queued => self.inner.board.log(&format!("Queued {label}")),
            EnqueueOutcome::AlreadyQueued => self.inner.board.set_status(format!("{label} is already queued")),
        }
        outcome
    }

    /// Drops pending jobs and asks the active one to stop at the next file.
    pub fn cancel_all(&self) {
        let dropped = {
            let mut state = self.inner.lock();
            let dropped = state.queue.clear_pending();
            if let Some(token) = &state.cancel {
                token.cancel();
            }
            self.inner.publish_queue(&state);
            dropped
        };
        self.inner.board.set_status(format!("Cancelling; {dropped} pending jobs dropped"));
    }

    /// Spawns the worker unless one is already running or there is no work.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        {
            let mut state = self.inner.lock();
            if state.worker_running || state.queue.is_empty() {
                return None;
            }
            state.worker_running = true;
        }
        let inner = self.inner.clone();
        Some(tokio::spawn(async move { inner.run_worker().await }))
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().worker_running
    }

    /// Reports of completed jobs, oldest first.
    pub fn finished(&self) -> Vec<(String, JobReport)> {
        self.inner.lock().finished.clone()
    }

    /// Runs one job on the caller's task, outside the queue.
    pub async fn process_job(&self, job: &Job, cancel: &CancellationToken) -> JobReport {
        self.inner.process_job(job, cancel).await
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Queue lock poisoned; continuing with the last known state");
            poisoned.into_inner()
        })
    }

    fn publish_queue(&self, state: &QueueState) {
        self.board.set_queue(state.queue.labels(), state.queue.active().map(Job::label));
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                match state.queue.pop_next() {
                    Some(job) => {
                        let token = CancellationToken::new();
                        state.cancel = Some(token.clone());
                        self.publish_queue(&state);
                        Some((job, token))
                    }
                    None => {
                        state.worker_running = false;
                        self.publish_queue(&state);
                        None
                    }
                }
            };
            let Some((job, token)) = next else {
                tracing::debug!("Queue empty; worker stopping");
                return;
            };

            let label = job.label();
            tracing::info!("Starting job {label}");
            let report = self.process_job(&job, &token).await;
            tracing::info!("Finished job {label}: {report:?}");

            let mut state = self.lock();
            state.queue.finish_active();
            state.cancel = None;
            state.finished.push((label, report));
            self.publish_queue(&state);
        }
    }

    async fn process_job(&self, job: &Job, cancel: &CancellationToken) -> JobReport {
        match job {
            Job::SplitFiles { paths } => {
                self.board.set_status(format!("Splitting {} files", paths.len()));
                let outcome = split::split_files(paths, self.settings.split_threshold, cancel).await;
                self.board.set_status(format!(
                    "Split done: {} split, {} small enough, {} failed",
                    outcome.split, outcome.skipped, outcome.failed
                ));
                JobReport {
                    candidates: paths.len(),
                    failed: outcome.failed,
                    cancelled: outcome.cancelled,
                    ..Default::default()
                }
            }
            Job::RecursiveBackup { source_path, archive_after_transfer } => {
                self.board.set_status(format!("Listing {source_path}"));
                let board = &self.board;
                let listed = self
                    .store
                    .list_recursive(source_path, &mut |dir: &str| board.log(&format!("Scanning {dir}")))
                    .await;
                match listed {
                    Ok(files) => self.backup(files, source_path, *archive_after_transfer, cancel).await,
                    Err(e) => {
                        tracing::error!("Listing {source_path} failed: {e}");
                        self.board.set_status(format!("Listing {source_path} failed: {e}"));
                        JobReport { aborted: true, ..Default::default() }
                    }
                }
            }
            Job::SelectedBackup { files, source_path, archive_after_transfer } => {
                self.backup(files.clone(), source_path, *archive_after_transfer, cancel).await
            }
        }
    }

    async fn backup(
        &self,
        listed: Vec<RemoteFileDescriptor>,
        source_path: &str,
        archive: bool,
        cancel: &CancellationToken,
    ) -> JobReport {
        let candidates: Vec<RemoteFileDescriptor> =
            listed.into_iter().filter(|f| !f.is_directory && is_candidate(&f.name)).collect();
        let mut report = JobReport { candidates: candidates.len(), ..Default::default() };

        let mirror_root = self.layout.mirror_root();
        match cleanup::recover_commit_artifacts(mirror_root).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Recovered {n} leftovers from an interrupted commit"),
            Err(e) => tracing::warn!("Could not inspect {} for leftovers: {e}", mirror_root.display()),
        }

        let engine = DownloadEngine::new(self.store.as_ref(), &self.layout, self.space.as_ref(), &self.settings);
        match engine.free_space() {
            Ok(free) if space::budget(free, self.settings.reserve_bytes).is_some() => {}
            Ok(free) => {
                let e = BackupError::InsufficientStorage { required: self.settings.reserve_bytes, available: free };
                return self.abort(report, e);
            }
            Err(e) => return self.abort(report, e),
        }

        let relocator = Relocator::new(self.store.as_ref(), &self.layout, &self.settings);
        let mut progress = ProgressState::new(candidates.iter().map(|f| f.size).sum());
        self.board.clear_progress();
        let total = candidates.len();

        for (index, file) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.board.set_status(format!("Downloading {} ({}/{total})", file.name, index + 1));

            let mut reported = 0u64;
            let board = &self.board;
            let outcome = {
                let progress = &mut progress;
                engine
                    .process(file, cancel, &mut |n| {
                        reported += n;
                        progress.advance(n);
                        board.set_progress(progress);
                    })
                    .await
            };
            progress.advance(file.size.saturating_sub(reported));
            self.board.set_progress(&progress);

            match &outcome {
                FileOutcome::Downloaded { bytes, .. } => {
                    report.downloaded += 1;
                    tracing::info!("Downloaded {} ({})", file.path, crate::format_size(*bytes));
                }
                FileOutcome::AlreadyPresent { .. } => report.skipped_existing += 1,
                FileOutcome::SkippedBudget { .. } => {
                    report.skipped_budget += 1;
                    self.board.log(&format!("Skipped {}: not enough free space", file.name));
                }
                FileOutcome::Failed(e) => {
                    report.failed += 1;
                    self.board.set_status(format!("Failed {}: {e}", file.name));
                }
                FileOutcome::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }

            if archive && outcome.is_synced() {
                self.board.set_status(format!("Archiving {}", file.name));
                match relocator.relocate(file).await {
                    Ok(Relocation::AlreadyArchived) => {}
                    Ok(_) => report.relocated += 1,
                    Err(e) => {
                        report.relocation_failed += 1;
                        tracing::warn!("Archiving {} failed: {e}", file.path);
                        self.board.log(&format!("Archiving {} failed: {e}", file.name));
                    }
                }
            }
        }

        match cleanup::prune_empty_local_dirs(mirror_root).await {
            Ok(n) => report.cleaned_dirs += n,
            Err(e) => tracing::warn!("Local cleanup failed: {e}"),
        }
        if archive && !report.cancelled && report.relocated > 0 {
            self.board.set_status(format!("Tidying {source_path}"));
            let dirs = cleanup::ancestors_to_clean(candidates.iter().map(|f| f.path.as_str()), source_path);
            report.cleaned_dirs +=
                cleanup::clean_remote_dirs(self.store.as_ref(), &dirs, &self.settings.source_prefixes).await;
        }

        self.board.clear_progress();
        self.board.set_status(if report.cancelled {
            format!("Cancelled after {} downloads", report.downloaded)
        } else {
            format!(
                "Done: {} downloaded, {} already present, {} skipped for space, {} failed, {} archived",
                report.downloaded, report.skipped_existing, report.skipped_budget, report.failed, report.relocated
            )
        });
        report
    }

    fn abort(&self, mut report: JobReport, e: BackupError) -> JobReport {
        tracing::error!("Job aborted: {e}");
        self.board.set_status(format!("Job aborted: {e}"));
        report.aborted = true;
        report
    }
}
