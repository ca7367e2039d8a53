//! Retained snapshot files.
//!
//! Layout: `<data_dir>/raft/snapshots/<index>-<term>/` holding `state.json` (the encoded routing
//! table) and `meta.json` (raft snapshot meta, byte size and sha256 of `state.json`). A snapshot is
//! built in a `*.tmp` directory and renamed into place, so a directory without the suffix is always
//! complete. Re-saving an existing key moves the old directory to `*.old` until the new one is in
//! place; `open` puts it back if the replacement never landed. Only the newest `retain` snapshots
//! are kept.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use openraft::SnapshotMeta;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info, warn};

use super::fs::{blocking, read_json_blocking, sync_dir, write_atomic};
use crate::raft::types::{NodeId, NodeMeta};

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.json";
const TMP_SUFFIX: &str = ".tmp";
const OLD_SUFFIX: &str = ".old";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotManifest {
    meta: SnapshotMeta<NodeId, NodeMeta>,
    size: u64,
    sha256: String,
}

#[derive(Debug)]
pub enum SnapshotStoreError {
    Io(io::Error),
    Corrupt { dir: PathBuf, reason: String },
}

impl std::fmt::Display for SnapshotStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "snapshot store io: {e}"),
            Self::Corrupt { dir, reason } => {
                write!(f, "corrupt snapshot {}: {reason}", dir.display())
            }
        }
    }
}

impl std::error::Error for SnapshotStoreError {}

impl From<io::Error> for SnapshotStoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SnapshotStoreError> for io::Error {
    fn from(e: SnapshotStoreError) -> Self {
        match e {
            SnapshotStoreError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// A snapshot read back from disk, checksum verified.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<NodeId, NodeMeta>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Open the snapshot directory, undoing whatever a crash left half done: an `*.old` directory
    /// whose replacement is missing is restored, and half-built snapshots are removed.
    pub async fn open(data_dir: &Path, retain: usize) -> Result<Self, SnapshotStoreError> {
        let dir = data_dir.join("raft").join("snapshots");
        let store = Self {
            dir: dir.clone(),
            retain: retain.max(1),
        };
        blocking(move || {
            fs::create_dir_all(&dir)?;
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(key) = name.strip_suffix(OLD_SUFFIX) else {
                    continue;
                };
                let final_dir = dir.join(key);
                if final_dir.exists() {
                    debug!(path = %entry.path().display(), "removing replaced snapshot");
                    fs::remove_dir_all(entry.path())?;
                } else {
                    warn!(path = %final_dir.display(), "restoring snapshot interrupted by a re-save");
                    fs::rename(entry.path(), &final_dir)?;
                }
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                if name.to_string_lossy().ends_with(TMP_SUFFIX) {
                    warn!(path = %entry.path().display(), "removing incomplete snapshot");
                    fs::remove_dir_all(entry.path())?;
                }
            }
            sync_dir(&dir)?;
            Ok(())
        })
        .await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably write a snapshot, then prune older ones beyond the retain count.
    pub async fn save(
        &self,
        meta: &SnapshotMeta<NodeId, NodeMeta>,
        data: &[u8],
    ) -> Result<PathBuf, SnapshotStoreError> {
        let manifest = SnapshotManifest {
            meta: meta.clone(),
            size: data.len() as u64,
            sha256: sha256_hex(data),
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).map_err(io::Error::other)?;
        let data = data.to_vec();
        let key = snapshot_key(meta);
        let root = self.dir.clone();

        let final_dir = blocking(move || {
            let final_dir = root.join(&key);
            let tmp_dir = root.join(format!("{key}{TMP_SUFFIX}"));
            let old_dir = root.join(format!("{key}{OLD_SUFFIX}"));
            if tmp_dir.exists() {
                fs::remove_dir_all(&tmp_dir)?;
            }
            fs::create_dir_all(&tmp_dir)?;
            write_atomic(&tmp_dir.join(STATE_FILE), &data)?;
            write_atomic(&tmp_dir.join(META_FILE), &manifest_bytes)?;
            let replaced = final_dir.exists();
            if replaced {
                if old_dir.exists() {
                    fs::remove_dir_all(&old_dir)?;
                }
                fs::rename(&final_dir, &old_dir)?;
            }
            fs::rename(&tmp_dir, &final_dir)?;
            sync_dir(&root)?;
            if replaced {
                fs::remove_dir_all(&old_dir)?;
                sync_dir(&root)?;
            }
            Ok(final_dir)
        })
        .await?;

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_id = ?meta.last_log_id,
            size = manifest.size,
            path = %final_dir.display(),
            "saved snapshot"
        );
        self.prune().await?;
        Ok(final_dir)
    }

    /// The newest snapshot, or `None` when none exists. A newest snapshot that fails its checksum
    /// is an error, not a reason to fall back to an older one.
    pub async fn latest(&self) -> Result<Option<StoredSnapshot>, SnapshotStoreError> {
        let Some((_, name)) = self.list_keys().await?.pop() else {
            return Ok(None);
        };
        let dir = self.dir.join(name);
        blocking(move || Ok(load_snapshot(&dir))).await?.map(Some)
    }

    /// `(index, term)` of every complete snapshot, oldest first.
    pub async fn list(&self) -> Result<Vec<(u64, u64)>, SnapshotStoreError> {
        Ok(self
            .list_keys()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn list_keys(&self) -> io::Result<Vec<((u64, u64), String)>> {
        let dir = self.dir.clone();
        blocking(move || {
            let mut keys = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(key) = parse_snapshot_key(&name) {
                    keys.push((key, name));
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn prune(&self) -> Result<(), SnapshotStoreError> {
        let keys = self.list_keys().await?;
        if keys.len() <= self.retain {
            return Ok(());
        }
        let doomed: Vec<PathBuf> = keys[..keys.len() - self.retain]
            .iter()
            .map(|(_, name)| self.dir.join(name))
            .collect();
        blocking(move || {
            for dir in doomed {
                debug!(path = %dir.display(), "pruning old snapshot");
                fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }
}

fn load_snapshot(dir: &Path) -> Result<StoredSnapshot, SnapshotStoreError> {
    let corrupt = |reason: String| SnapshotStoreError::Corrupt {
        dir: dir.to_path_buf(),
        reason,
    };
    let manifest = read_json_blocking::<SnapshotManifest>(&dir.join(META_FILE))
        .map_err(|e| corrupt(format!("meta: {e}")))?
        .ok_or_else(|| corrupt("missing meta.json".to_string()))?;
    let data = fs::read(dir.join(STATE_FILE)).map_err(|e| corrupt(format!("state: {e}")))?;

    if data.len() as u64 != manifest.size {
        return Err(corrupt(format!(
            "size mismatch: meta says {}, file has {}",
            manifest.size,
            data.len()
        )));
    }
    let actual = sha256_hex(&data);
    if actual != manifest.sha256 {
        return Err(corrupt(format!(
            "sha256 mismatch: meta says {}, file hashes to {actual}",
            manifest.sha256
        )));
    }
    Ok(StoredSnapshot {
        meta: manifest.meta,
        data,
    })
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Zero padded so lexical and numeric order agree when listing by hand.
fn snapshot_key(meta: &SnapshotMeta<NodeId, NodeMeta>) -> String {
    let (index, term) = meta
        .last_log_id
        .map(|l| (l.index, l.leader_id.term))
        .unwrap_or((0, 0));
    format!("{index:020}-{term:020}")
}

fn parse_snapshot_key(name: &str) -> Option<(u64, u64)> {
    let (index, term) = name.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}
