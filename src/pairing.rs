use crate::error::SyncError;
use crate::models::TaskRecord;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

const STATE_VERSION: u32 = 1;
const STALE_LOCK_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

/// Keys of pairs whose remote task does not exist yet.
pub const PROVISIONAL_PREFIX: &str = "local:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairEntry {
    pub remote_id: String,
    pub local_id: String,
    pub remote_fingerprint: String,
    pub local_fingerprint: String,
    pub last_synced_at: DateTime<Utc>,
    /// Customer name last written into the reminder's note trailer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{field} {id} already belongs to pair {existing}")]
pub struct PairConflict {
    pub field: &'static str,
    pub id: String,
    pub existing: String,
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    pairs: BTreeMap<String, PairEntry>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    retired: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingStore {
    pairs: BTreeMap<String, PairEntry>,
    /// Remote ids whose pair ended because the reminder was completed. A
    /// completed reminder linking one of them is history, not a pending push.
    retired: BTreeSet<String>,
}

impl PairingStore {
    /// A missing file is a first run; an unreadable one is an error, never a reset.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(SyncError::State(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };
        let state: StateFile = serde_json::from_str(&content)
            .map_err(|e| SyncError::State(format!("{} is corrupt: {e}", path.display())))?;
        if state.version != STATE_VERSION {
            return Err(SyncError::State(format!(
                "{} has unsupported version {}",
                path.display(),
                state.version
            )));
        }
        debug!(
            pairs = state.pairs.len(),
            retired = state.retired.len(),
            path = %path.display(),
            "loaded sync state"
        );
        Ok(Self {
            pairs: state.pairs,
            retired: state.retired,
        })
    }

    /// Writes a sibling temp file, syncs it, then renames it over `path`.
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let state = StateFile {
            version: STATE_VERSION,
            pairs: self.pairs.clone(),
            retired: self.retired.clone(),
        };
        let content = serde_json::to_string_pretty(&state)?;
        let tmp = sibling(path, "tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(pairs = self.pairs.len(), path = %path.display(), "saved sync state");
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PairEntry> {
        self.pairs.get(key)
    }

    /// Inserts or replaces `key`. Refuses an entry whose remote or local id is
    /// already held by another key. A recorded pair is live again, so its
    /// remote id leaves the retired set.
    pub fn set(&mut self, key: &str, entry: PairEntry) -> Result<(), PairConflict> {
        for (other, existing) in &self.pairs {
            if other == key {
                continue;
            }
            if existing.remote_id == entry.remote_id {
                return Err(PairConflict {
                    field: "remote id",
                    id: entry.remote_id,
                    existing: other.clone(),
                });
            }
            if existing.local_id == entry.local_id {
                return Err(PairConflict {
                    field: "local id",
                    id: entry.local_id,
                    existing: other.clone(),
                });
            }
        }
        self.retired.remove(&entry.remote_id);
        self.pairs.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<PairEntry> {
        self.pairs.remove(key)
    }

    /// Ends the pair for `key` and remembers that it ended in completion.
    pub fn retire(&mut self, key: &str) -> Option<PairEntry> {
        self.retired.insert(key.to_string());
        self.pairs.remove(key)
    }

    pub fn is_retired(&self, key: &str) -> bool {
        self.retired.contains(key)
    }

    pub fn forget_retired(&mut self, key: &str) -> bool {
        self.retired.remove(key)
    }

    pub fn retired(&self) -> impl Iterator<Item = &str> {
        self.retired.iter().map(String::as_str)
    }

    pub fn key_for_local(&self, local_id: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(_, entry)| entry.local_id == local_id)
            .map(|(key, _)| key.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Exclusive marker next to the state file, held for the whole run.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(state_path: &Path) -> Result<Self, SyncError> {
        let path = sibling(state_path, "lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !is_stale(&path) {
                    return Err(SyncError::StateLocked { path });
                }
                warn!(path = %path.display(), "replacing abandoned state lock");
                fs::remove_file(&path)?;
                Self::create(&path).map_err(|err| match err.kind() {
                    io::ErrorKind::AlreadyExists => SyncError::StateLocked { path: path.clone() },
                    _ => SyncError::Io(err),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release state lock");
        }
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AFTER)
}

/// Title, due date and status class as last observed on the remote side.
pub fn fingerprint_remote(record: &TaskRecord) -> String {
    stable_hash(&format!(
        "{}|{}|{}",
        record.title,
        due_signature(record.due_date),
        record.status_class()
    ))
}

/// Title, due date and completion as last observed on the local side.
pub fn fingerprint_local(record: &TaskRecord) -> String {
    stable_hash(&format!(
        "{}|{}|{}",
        record.title,
        due_signature(record.due_date),
        record.completed
    ))
}

fn due_signature(due: Option<NaiveDate>) -> String {
    due.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn stable_hash(input: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in input.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:x}", hash)
}
