//! Local free-space probing and the download budget.

use std::path::Path;
use sysinfo::Disks;

use crate::Result;

pub trait SpaceProbe: Send + Sync {
    /// Bytes available to this process on the volume holding `path`.
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// Reads free space from the mounted volume list.
#[derive(Debug, Default)]
pub struct DiskSpace;

impl SpaceProbe for DiskSpace {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        // The mirror root may not exist yet; measure the nearest existing ancestor.
        let mut probe = path;
        while !probe.exists() {
            match probe.parent() {
                Some(parent) => probe = parent,
                None => break,
            }
        }
        let probe = probe.canonicalize().unwrap_or_else(|_| probe.to_path_buf());

        let disks = Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|d| probe.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match best {
            Some(disk) => Ok(disk.available_space()),
            None => {
                tracing::warn!("No mounted volume found for {}", probe.display());
                Ok(0)
            }
        }
    }
}

/// Budget left for downloads once the reserve is set aside. `None` means the
/// reserve itself is not covered.
pub fn budget(free: u64, reserve: u64) -> Option<u64> {
    free.checked_sub(reserve).filter(|b| *b > 0)
}

/// True when a file of `size` bytes fits into `free` while keeping `reserve`.
pub fn fits(free: u64, reserve: u64, size: u64) -> bool {
    budget(free, reserve).is_some_and(|b| b >= size)
}
