//! Durable replicated log and stable key/value store.
//!
//! Both live under `<data_dir>/raft/`:
//! - `log.json`: the log entries plus the id of the last compacted entry.
//! - `stable.json`: small named values (vote, current term, commit index).
//!
//! Each mutation builds the new state on a copy, persists it with an atomic replace, and only then
//! swaps it in, so the in-memory view never runs ahead of disk and a failed write leaves both
//! unchanged.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    io,
    ops::RangeBounds,
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use openraft::{
    ErrorSubject, ErrorVerb, LogId, LogState, RaftLogReader, Vote,
    storage::{LogFlushed, RaftLogStorage},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::fs::{blocking, read_json, write_json};
use crate::raft::types::{NodeId, TypeConfig};

pub type LogEntry = openraft::impls::Entry<TypeConfig>;

pub const VOTE_KEY: &str = "vote";
pub const CURRENT_TERM_KEY: &str = "current_term";
pub const COMMITTED_KEY: &str = "committed";

#[derive(Debug)]
pub enum LogStoreError {
    NotFound { what: String },
    /// An append would leave a hole after the current last index.
    Gap { expected: u64, got: u64 },
    /// An append batch whose indexes are not consecutive.
    NonContiguous { prev: u64, next: u64 },
    /// An append reaching into the compacted prefix.
    Compacted { index: u64, purged: u64 },
    /// A range deletion that touches neither end of the log.
    Hole { min: u64, max: u64 },
    Corrupt { reason: String },
    Io(io::Error),
}

impl LogStoreError {
    fn into_io(self) -> io::Error {
        match self {
            Self::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}

impl std::fmt::Display for LogStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { what } => write!(f, "not found: {what}"),
            Self::Gap { expected, got } => {
                write!(f, "log gap: next index is {expected}, got {got}")
            }
            Self::NonContiguous { prev, next } => {
                write!(f, "append batch is not contiguous: {prev} then {next}")
            }
            Self::Compacted { index, purged } => {
                write!(f, "index {index} is at or below the compacted prefix ({purged})")
            }
            Self::Hole { min, max } => {
                write!(f, "deleting {min}..={max} would leave a hole in the log")
            }
            Self::Corrupt { reason } => write!(f, "corrupt log store: {reason}"),
            Self::Io(e) => write!(f, "log store io: {e}"),
        }
    }
}

impl std::error::Error for LogStoreError {}

impl From<io::Error> for LogStoreError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            return Self::Corrupt {
                reason: e.to_string(),
            };
        }
        Self::Io(e)
    }
}

#[derive(Debug, Clone)]
pub struct LogPaths {
    pub dir: PathBuf,
    pub log_json: PathBuf,
    pub stable_json: PathBuf,
}

impl LogPaths {
    pub fn new(data_dir: &Path) -> Self {
        let dir = data_dir.join("raft");
        Self {
            log_json: dir.join("log.json"),
            stable_json: dir.join("stable.json"),
            dir,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedLog {
    #[serde(default)]
    last_purged_log_id: Option<LogId<NodeId>>,
    #[serde(default)]
    entries: Vec<LogEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStable {
    /// Base64 values keyed by name.
    #[serde(default)]
    values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
struct WalLog {
    last_purged_log_id: Option<LogId<NodeId>>,
    entries: BTreeMap<u64, LogEntry>,
}

impl WalLog {
    fn last_log_id(&self) -> Option<LogId<NodeId>> {
        self.entries
            .values()
            .next_back()
            .map(|ent| ent.log_id)
            .or(self.last_purged_log_id)
    }

    /// The only index an append may start past, if anything constrains it yet.
    fn next_index(&self) -> Option<u64> {
        self.last_log_id().map(|l| l.index + 1)
    }

    fn check_contiguous(&self) -> Result<(), LogStoreError> {
        let mut prev = self.last_purged_log_id.map(|l| l.index);
        for (index, ent) in &self.entries {
            if *index != ent.log_id.index {
                return Err(LogStoreError::Corrupt {
                    reason: format!("entry keyed {index} has log index {}", ent.log_id.index),
                });
            }
            if let Some(prev) = prev
                && *index != prev + 1
            {
                return Err(LogStoreError::Corrupt {
                    reason: format!("entry {index} follows {prev}"),
                });
            }
            prev = Some(*index);
        }
        Ok(())
    }

    fn to_persisted(&self) -> PersistedLog {
        PersistedLog {
            last_purged_log_id: self.last_purged_log_id,
            entries: self.entries.values().cloned().collect(),
        }
    }
}

#[derive(Debug)]
struct WalInner {
    log: WalLog,
    stable: BTreeMap<String, Vec<u8>>,
}

/// File-backed log store, cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    paths: LogPaths,
    inner: Arc<Mutex<WalInner>>,
}

impl FileLogStore {
    /// Open (or create) the store under `data_dir`, recovering whatever was last fully persisted.
    pub async fn open(data_dir: &Path) -> Result<Self, LogStoreError> {
        let paths = LogPaths::new(data_dir);
        let dir = paths.dir.clone();
        blocking(move || std::fs::create_dir_all(dir)).await?;

        let persisted = read_json::<PersistedLog>(&paths.log_json)
            .await?
            .unwrap_or_default();
        let log = WalLog {
            last_purged_log_id: persisted.last_purged_log_id,
            entries: persisted
                .entries
                .into_iter()
                .map(|ent| (ent.log_id.index, ent))
                .collect(),
        };
        log.check_contiguous()?;

        let persisted = read_json::<PersistedStable>(&paths.stable_json)
            .await?
            .unwrap_or_default();
        let mut stable = BTreeMap::new();
        for (key, value) in persisted.values {
            let bytes = STANDARD
                .decode(value.as_bytes())
                .map_err(|e| LogStoreError::Corrupt {
                    reason: format!("stable key {key}: {e}"),
                })?;
            stable.insert(key, bytes);
        }

        debug!(
            entries = log.entries.len(),
            last_purged = ?log.last_purged_log_id,
            "opened log store"
        );

        Ok(Self {
            paths,
            inner: Arc::new(Mutex::new(WalInner { log, stable })),
        })
    }

    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    /// Append a contiguous batch.
    ///
    /// An entry whose index already holds the same log id is kept as is. An entry whose index
    /// holds a different log id replaces it and drops every later entry.
    pub async fn append_entries<I>(&self, entries: I) -> Result<(), LogStoreError>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let entries: Vec<LogEntry> = entries.into_iter().collect();
        let Some(first) = entries.first().map(|ent| ent.log_id.index) else {
            return Ok(());
        };
        for pair in entries.windows(2) {
            let (prev, next) = (pair[0].log_id.index, pair[1].log_id.index);
            if next != prev + 1 {
                return Err(LogStoreError::NonContiguous { prev, next });
            }
        }

        let mut inner = self.inner.lock().await;
        let mut log = inner.log.clone();
        if let Some(purged) = log.last_purged_log_id
            && first <= purged.index
        {
            return Err(LogStoreError::Compacted {
                index: first,
                purged: purged.index,
            });
        }
        if let Some(expected) = log.next_index()
            && first > expected
        {
            return Err(LogStoreError::Gap {
                expected,
                got: first,
            });
        }

        for ent in entries {
            let index = ent.log_id.index;
            match log.entries.get(&index) {
                Some(existing) if existing.log_id == ent.log_id => continue,
                Some(existing) => {
                    debug!(index, old = %existing.log_id, new = %ent.log_id, "replacing conflicting suffix");
                    log.entries.split_off(&index);
                }
                None => {}
            }
            log.entries.insert(index, ent);
        }

        write_json(&self.paths.log_json, &log.to_persisted()).await?;
        inner.log = log;
        Ok(())
    }

    pub async fn get_entry(&self, index: u64) -> Result<LogEntry, LogStoreError> {
        let inner = self.inner.lock().await;
        inner
            .log
            .entries
            .get(&index)
            .cloned()
            .ok_or_else(|| LogStoreError::NotFound {
                what: format!("log index {index}"),
            })
    }

    /// Lowest stored index, or 0 when the log is empty.
    ///
    /// Index 0 is also a real position (the entry that bootstraps membership); use
    /// [`Self::is_empty`] when the distinction matters.
    pub async fn first_index(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.log.entries.keys().next().copied().unwrap_or(0)
    }

    /// Highest stored index, or 0 when the log is empty.
    pub async fn last_index(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.log.entries.keys().next_back().copied().unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.log.entries.is_empty()
    }

    pub async fn last_purged_log_id(&self) -> Option<LogId<NodeId>> {
        self.inner.lock().await.log.last_purged_log_id
    }

    /// Remove every entry in `min..=max`. The range must reach one end of the log.
    ///
    /// A range reaching the last entry truncates a conflicting suffix. Otherwise it compacts the
    /// prefix, and the last removed entry becomes the compaction point as with
    /// [`Self::purge_through`].
    pub async fn delete_range(&self, min: u64, max: u64) -> Result<(), LogStoreError> {
        if min > max {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let mut log = inner.log.clone();
        let (Some(first), Some(last)) = (
            log.entries.keys().next().copied(),
            log.entries.keys().next_back().copied(),
        ) else {
            return Ok(());
        };
        if min > first && max < last {
            return Err(LogStoreError::Hole { min, max });
        }

        let doomed: Vec<u64> = log.entries.range(min..=max).map(|(k, _)| *k).collect();
        let Some(last_removed) = doomed
            .last()
            .and_then(|index| log.entries.get(index))
            .map(|ent| ent.log_id)
        else {
            return Ok(());
        };
        for index in &doomed {
            log.entries.remove(index);
        }
        if max < last {
            log.last_purged_log_id = Some(last_removed);
        }

        write_json(&self.paths.log_json, &log.to_persisted()).await?;
        debug!(min, max, removed = doomed.len(), "deleted log range");
        inner.log = log;
        Ok(())
    }

    /// Drop everything up to and including `log_id` and remember it as the compaction point.
    pub async fn purge_through(&self, log_id: LogId<NodeId>) -> Result<(), LogStoreError> {
        let mut inner = self.inner.lock().await;
        let mut log = inner.log.clone();
        log.entries = log.entries.split_off(&(log_id.index + 1));
        log.last_purged_log_id = Some(log_id);

        write_json(&self.paths.log_json, &log.to_persisted()).await?;
        debug!(through = log_id.index, "purged log prefix");
        inner.log = log;
        Ok(())
    }

    pub async fn set_stable(&self, key: &str, value: &[u8]) -> Result<(), LogStoreError> {
        self.set_stable_many(vec![(key.to_string(), value.to_vec())])
            .await
    }

    pub async fn get_stable(&self, key: &str) -> Result<Vec<u8>, LogStoreError> {
        let inner = self.inner.lock().await;
        inner
            .stable
            .get(key)
            .cloned()
            .ok_or_else(|| LogStoreError::NotFound {
                what: format!("stable key {key}"),
            })
    }

    /// Stored as decimal text.
    pub async fn set_stable_u64(&self, key: &str, value: u64) -> Result<(), LogStoreError> {
        self.set_stable(key, value.to_string().as_bytes()).await
    }

    pub async fn get_stable_u64(&self, key: &str) -> Result<u64, LogStoreError> {
        let bytes = self.get_stable(key).await?;
        std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| LogStoreError::Corrupt {
                reason: format!("stable key {key} is not a decimal u64"),
            })
    }

    /// Several keys in one durable write.
    async fn set_stable_many(&self, values: Vec<(String, Vec<u8>)>) -> Result<(), LogStoreError> {
        let mut inner = self.inner.lock().await;
        let mut stable = inner.stable.clone();
        stable.extend(values);

        let persisted = PersistedStable {
            values: stable
                .iter()
                .map(|(k, v)| (k.clone(), STANDARD.encode(v)))
                .collect(),
        };
        write_json(&self.paths.stable_json, &persisted).await?;
        inner.stable = stable;
        Ok(())
    }

    async fn get_stable_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, LogStoreError> {
        let bytes = match self.get_stable(key).await {
            Ok(bytes) => bytes,
            Err(LogStoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| LogStoreError::Corrupt {
                reason: format!("stable key {key}: {e}"),
            })
    }
}

fn storage_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: LogStoreError,
) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(subject, verb, err.into_io())
}

fn encode_err(subject: ErrorSubject<NodeId>, e: serde_json::Error) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(subject, ErrorVerb::Write, io::Error::other(e))
}

impl RaftLogReader<TypeConfig> for FileLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + openraft::OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<LogEntry>, openraft::StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .log
            .entries
            .range(range)
            .map(|(_, ent)| ent.clone())
            .collect())
    }
}

impl RaftLogStorage<TypeConfig> for FileLogStore {
    type LogReader = FileLogStore;

    async fn get_log_state(
        &mut self,
    ) -> Result<LogState<TypeConfig>, openraft::StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        Ok(LogState {
            last_purged_log_id: inner.log.last_purged_log_id,
            last_log_id: inner.log.last_log_id(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<NodeId>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let encoded = serde_json::to_vec(vote).map_err(|e| encode_err(ErrorSubject::Vote, e))?;
        self.set_stable_many(vec![
            (VOTE_KEY.to_string(), encoded),
            (
                CURRENT_TERM_KEY.to_string(),
                vote.leader_id.term.to_string().into_bytes(),
            ),
        ])
        .await
        .map_err(|e| storage_err(ErrorSubject::Vote, ErrorVerb::Write, e))
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, openraft::StorageError<NodeId>> {
        self.get_stable_json(VOTE_KEY)
            .await
            .map_err(|e| storage_err(ErrorSubject::Vote, ErrorVerb::Read, e))
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let encoded =
            serde_json::to_vec(&committed).map_err(|e| encode_err(ErrorSubject::Store, e))?;
        self.set_stable(COMMITTED_KEY, &encoded)
            .await
            .map_err(|e| storage_err(ErrorSubject::Store, ErrorVerb::Write, e))
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<NodeId>>, openraft::StorageError<NodeId>> {
        let committed: Option<Option<LogId<NodeId>>> = self
            .get_stable_json(COMMITTED_KEY)
            .await
            .map_err(|e| storage_err(ErrorSubject::Store, ErrorVerb::Read, e))?;
        Ok(committed.flatten())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = LogEntry> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        match self.append_entries(entries).await {
            Ok(()) => {
                callback.log_io_completed(Ok(()));
                Ok(())
            }
            Err(e) => {
                callback.log_io_completed(Err(io::Error::other(e.to_string())));
                Err(storage_err(ErrorSubject::Logs, ErrorVerb::Write, e))
            }
        }
    }

    async fn truncate(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        self.delete_range(log_id.index, u64::MAX)
            .await
            .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Delete, e))
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), openraft::StorageError<NodeId>> {
        self.purge_through(log_id)
            .await
            .map_err(|e| storage_err(ErrorSubject::Logs, ErrorVerb::Delete, e))
    }
}
