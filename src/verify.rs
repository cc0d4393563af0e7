//! Content comparison between remote files.
//!
//! Two strengths: a cheap head/tail byte comparison, which can only prove a
//! difference (equality is a probabilistic signal), and a remote checksum
//! comparison, which is exact but costs a full read on the server.

use bytes::Bytes;

use crate::remote::{RemoteFileDescriptor, RemoteStore};
use crate::task::{self, PollPolicy};
use crate::Result;

/// Bytes compared at each end of a file.
pub const PROBE_BYTES: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Probably identical: sampled bytes agree.
    LikelySame,
    /// Identical digests.
    Same,
    Different,
}

impl Verdict {
    pub fn is_different(self) -> bool {
        self == Verdict::Different
    }
}

/// Head and tail windows for a file of `size` bytes.
fn probe_ranges(size: u64) -> ((u64, u64), Option<(u64, u64)>) {
    let head = (0, size.min(PROBE_BYTES));
    let tail = (size > PROBE_BYTES).then(|| (size - PROBE_BYTES, size));
    (head, tail)
}

async fn sample(store: &dyn RemoteStore, file: &RemoteFileDescriptor) -> Result<(Bytes, Option<Bytes>)> {
    let (head, tail) = probe_ranges(file.size);
    match tail {
        // The two range requests are independent and go out together.
        Some((start, end)) => {
            let (h, t) = tokio::try_join!(
                store.download_range(&file.path, head.0, head.1),
                store.download_range(&file.path, start, end),
            )?;
            Ok((h, Some(t)))
        }
        None => Ok((store.download_range(&file.path, head.0, head.1).await?, None)),
    }
}

/// Compares sizes, then the first and last [`PROBE_BYTES`] of both files.
pub async fn partial_equal(
    store: &dyn RemoteStore,
    a: &RemoteFileDescriptor,
    b: &RemoteFileDescriptor,
) -> Result<Verdict> {
    if a.size != b.size {
        return Ok(Verdict::Different);
    }
    let left = sample(store, a).await?;
    let right = sample(store, b).await?;
    Ok(if left == right { Verdict::LikelySame } else { Verdict::Different })
}

/// Compares local bytes against a remote file's head and tail.
pub async fn local_matches_remote(
    store: &dyn RemoteStore,
    local: &std::path::Path,
    remote: &RemoteFileDescriptor,
) -> Result<Verdict> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let local_size = tokio::fs::metadata(local).await?.len();
    if local_size != remote.size {
        return Ok(Verdict::Different);
    }

    let (head, tail) = probe_ranges(local_size);
    let mut file = tokio::fs::File::open(local).await?;
    let mut local_head = vec![0u8; (head.1 - head.0) as usize];
    file.read_exact(&mut local_head).await?;
    let local_tail = match tail {
        Some((start, end)) => {
            let mut buf = vec![0u8; (end - start) as usize];
            file.seek(std::io::SeekFrom::Start(start)).await?;
            file.read_exact(&mut buf).await?;
            Some(Bytes::from(buf))
        }
        None => None,
    };

    let remote_sample = sample(store, remote).await?;
    Ok(if remote_sample == (Bytes::from(local_head), local_tail) {
        Verdict::LikelySame
    } else {
        Verdict::Different
    })
}

/// Exact comparison through remote checksums.
pub async fn strong_equal(store: &dyn RemoteStore, a: &str, b: &str, policy: PollPolicy) -> Result<Verdict> {
    let left = task::checksum(store, a, policy).await?;
    let right = task::checksum(store, b, policy).await?;
    Ok(if left.eq_ignore_ascii_case(&right) { Verdict::Same } else { Verdict::Different })
}
