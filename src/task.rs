//! Polling of long-running remote operations.
//!
//! A remote task goes `Started -> Polling{attempt} -> Finished | TimedOut`.
//! The transition is a pure function so the bound can be tested without a
//! server; [`drive`] only adds the sleeping and the remote calls.

use std::future::Future;
use std::time::Duration;

use crate::remote::{RemoteStore, TaskHandle};
use crate::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self { interval, max_attempts: max_attempts.max(1) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState<T> {
    Started,
    Polling { attempt: u32 },
    Finished(T),
    TimedOut { attempts: u32 },
}

impl<T> TaskState<T> {
    /// Applies one poll observation. `None` means "not finished yet".
    pub fn next(self, observed: Option<T>, max_attempts: u32) -> Self {
        let attempt = match self {
            TaskState::Started => 1,
            TaskState::Polling { attempt } => attempt + 1,
            done => return done,
        };
        match observed {
            Some(value) => TaskState::Finished(value),
            None if attempt >= max_attempts => TaskState::TimedOut { attempts: attempt },
            None => TaskState::Polling { attempt },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished(_) | TaskState::TimedOut { .. })
    }
}

/// Polls until the task finishes or the attempt bound is exhausted.
///
/// Transient poll errors count as an unfinished observation; anything else
/// aborts the wait.
pub async fn drive<T, F, Fut>(what: &str, policy: PollPolicy, mut poll: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut state = TaskState::Started;
    loop {
        tokio::time::sleep(policy.interval).await;
        let observed = match poll().await {
            Ok(observed) => observed,
            Err(e) if e.is_transient() => {
                tracing::debug!("Polling {what} failed transiently: {e}");
                None
            }
            Err(e) => return Err(e),
        };

        state = match state.next(observed, policy.max_attempts) {
            TaskState::Finished(value) => return Ok(value),
            TaskState::TimedOut { attempts } => {
                return Err(BackupError::RemoteTaskTimeout(format!("{what} after {attempts} polls")));
            }
            pending => pending,
        };
    }
}

/// Waits for a background move. `Ok(false)` means it finished but failed.
pub async fn wait_for_move(store: &dyn RemoteStore, handle: &TaskHandle, policy: PollPolicy) -> Result<bool> {
    drive(&format!("move task {}", handle.0), policy, move || async move {
        let status = store.poll_task(handle).await?;
        Ok(status.finished.then_some(status.success))
    })
    .await
}

/// Runs a remote checksum to completion and returns its digest.
pub async fn checksum(store: &dyn RemoteStore, path: &str, policy: PollPolicy) -> Result<String> {
    let handle = store.start_checksum(path).await?;
    let handle = &handle;
    let digest = drive(&format!("checksum of {path}"), policy, move || async move {
        let status = store.poll_checksum(handle).await?;
        Ok(status.finished.then_some(status.digest))
    })
    .await?;

    digest.ok_or_else(|| BackupError::Api { code: -1, message: format!("checksum of {path} finished without a digest") })
}
