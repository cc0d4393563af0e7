//! Moves mirrored originals on the NAS into the archive tree.

use std::time::Duration;

use crate::config::Settings;
use crate::mirror::MirrorLayout;
use crate::remote::{MoveStart, RemoteFileDescriptor, RemoteStore};
use crate::task::{self, PollPolicy};
use crate::{BackupError, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// Already below the archive root; nothing to do.
    AlreadyArchived,
    /// Present at the destination and gone from the source.
    Moved,
    /// The move copied instead; the leftover source was deleted.
    MovedAfterDelete,
}

/// Where a name was seen during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sighting {
    at_destination: bool,
    at_source: bool,
}

pub struct Relocator<'a> {
    store: &'a dyn RemoteStore,
    layout: &'a MirrorLayout,
    move_policy: PollPolicy,
    verify_attempts: u32,
    verify_delay: Duration,
}

impl<'a> Relocator<'a> {
    pub fn new(store: &'a dyn RemoteStore, layout: &'a MirrorLayout, settings: &Settings) -> Self {
        Self {
            store,
            layout,
            move_policy: PollPolicy::new(settings.move_poll_interval(), settings.move_poll_attempts),
            verify_attempts: settings.verify_attempts.max(1),
            verify_delay: settings.verify_delay(),
        }
    }

    /// Moves `file` into its archive directory and checks the result.
    ///
    /// An error leaves the source where it was, unless the move itself already
    /// took effect on the server.
    pub async fn relocate(&self, file: &RemoteFileDescriptor) -> Result<Relocation> {
        if self.layout.is_archived(&file.path) {
            return Ok(Relocation::AlreadyArchived);
        }

        let destination = self.layout.archive_dir(&file.path);
        self.store.create_directory(&destination).await?;

        match self.store.move_or_copy(&file.path, &destination).await? {
            MoveStart::Completed => {}
            MoveStart::Pending(handle) => {
                if !task::wait_for_move(self.store, &handle, self.move_policy).await? {
                    return Err(BackupError::Api {
                        code: -1,
                        message: format!("move of {} to {destination} reported failure", file.path),
                    });
                }
            }
        }

        let mut last = Sighting { at_destination: false, at_source: true };
        for attempt in 1..=self.verify_attempts {
            tokio::time::sleep(self.verify_delay).await;
            last = self.look(file, &destination).await?;
            tracing::debug!("Verify {} (attempt {attempt}): {last:?}", file.path);
            if last.at_destination && !last.at_source {
                return Ok(Relocation::Moved);
            }
        }

        if !last.at_destination {
            return Err(BackupError::NotFound(format!(
                "{} not found in {destination} after move",
                file.name
            )));
        }

        // The server copied rather than moved. The archived copy is confirmed,
        // so the source can go.
        tracing::info!("{} still present at source after move; deleting it", file.path);
        self.store.delete_file(&file.path).await?;
        Ok(Relocation::MovedAfterDelete)
    }

    async fn look(&self, file: &RemoteFileDescriptor, destination: &str) -> Result<Sighting> {
        let at_destination = self
            .listing(destination)
            .await?
            .iter()
            .any(|d| !d.is_directory && d.name == file.name && (file.size == 0 || d.size == file.size));
        let at_source = self
            .listing(file.parent())
            .await?
            .iter()
            .any(|d| !d.is_directory && d.name == file.name);
        Ok(Sighting { at_destination, at_source })
    }

    async fn listing(&self, dir: &str) -> Result<Vec<RemoteFileDescriptor>> {
        match self.store.list(dir).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            other => other,
        }
    }
}
