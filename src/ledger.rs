//! Durable record of local files already committed to the cloud library.
//!
//! Stored as one JSON document. Every insert rewrites it through a temporary
//! sibling and a rename, so a crash leaves either the previous or the new
//! ledger on disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub remote_id: String,
    pub committed_at_epoch_millis: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    entries: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug)]
pub struct TransferLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl TransferLedger {
    /// Opens the ledger at `path`, starting empty when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<LedgerFile>(&raw)?.entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("Ledger {} holds {} entries", path.display(), entries.len());
        Ok(Self { path, entries })
    }

    fn key(local_path: &Path) -> String {
        local_path.to_string_lossy().into_owned()
    }

    pub fn contains(&self, local_path: &Path) -> bool {
        self.entries.contains_key(&Self::key(local_path))
    }

    pub fn get(&self, local_path: &Path) -> Option<&LedgerEntry> {
        self.entries.get(&Self::key(local_path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a committed upload and persists the ledger before returning.
    ///
    /// A path already present keeps its first entry; the call is a no-op.
    pub fn record(&mut self, local_path: &Path, remote_id: &str) -> Result<bool> {
        let key = Self::key(local_path);
        if self.entries.contains_key(&key) {
            return Ok(false);
        }

        let committed_at_epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.entries.insert(
            key.clone(),
            LedgerEntry { remote_id: remote_id.to_string(), committed_at_epoch_millis },
        );

        if let Err(e) = self.save() {
            // Keep memory consistent with disk.
            self.entries.remove(&key);
            return Err(e);
        }
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let doc = LedgerFile { entries: self.entries.clone() };
        let json = serde_json::to_vec_pretty(&doc)?;

        let tmp = self.path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
