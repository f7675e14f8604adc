//! Durable per-post progress and metric cache
//!
//! The whole store is one JSON snapshot file. Every mutation writes a
//! complete new snapshot to a temp file in the same directory, fsyncs
//! it, then renames it over the old file, so a crash leaves either the
//! previous or the new snapshot on disk and never a mix.
//!
//! Writers serialize on one mutex; readers see the last committed
//! snapshot.

use super::types::{AggregatedRow, ProgressRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state file I/O error ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state store lock poisoned")]
    Poisoned,

    #[error("invalid TTL: {0}")]
    InvalidTtl(String),
}

/// On-disk snapshot of the state store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    #[serde(default)]
    pub posts: BTreeMap<String, ProgressRecord>,
    /// Resume cursor per account for an interrupted enumeration
    #[serde(default)]
    pub cursors: BTreeMap<String, String>,
    #[serde(default)]
    pub last_batch_write: Option<DateTime<Utc>>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            posts: BTreeMap::new(),
            cursors: BTreeMap::new(),
            last_batch_write: None,
        }
    }
}

pub struct StateStore {
    path: PathBuf,
    snapshot: RwLock<StateSnapshot>,
    writer: Mutex<()>,
}

impl StateStore {
    /// Open the store at `path`, loading the last committed snapshot
    ///
    /// A missing file is an empty store. Leftover temp files from an
    /// interrupted write are ignored.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateStoreError> {
        let path = path.into();
        let snapshot = load_snapshot(&path)?;

        log::info!(
            "Loaded state from {} ({} posts, {} cursors)",
            path.display(),
            snapshot.posts.len(),
            snapshot.cursors.len()
        );

        Ok(Self {
            path,
            snapshot: RwLock::new(snapshot),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, post_id: &str) -> Result<Option<ProgressRecord>, StateStoreError> {
        let snapshot = self.snapshot.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(snapshot.posts.get(post_id).cloned())
    }

    /// True if no record exists or its TTL has expired at `now`
    pub fn is_due(&self, post_id: &str, now: DateTime<Utc>) -> Result<bool, StateStoreError> {
        let snapshot = self.snapshot.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(snapshot
            .posts
            .get(post_id)
            .map_or(true, |record| record.is_due(now)))
    }

    /// Atomically persist a fresh record for `post_id`
    ///
    /// The record expires at `fetched_at + ttl` and starts unsynced.
    pub fn commit(
        &self,
        post_id: &str,
        row: AggregatedRow,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ProgressRecord, StateStoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StateStoreError::InvalidTtl(e.to_string()))?;
        let expires_at = fetched_at
            .checked_add_signed(ttl)
            .ok_or_else(|| StateStoreError::InvalidTtl("expiry overflows".to_string()))?;

        let record = ProgressRecord {
            last_fetched_at: fetched_at,
            expires_at,
            checksum: row.checksum()?,
            row,
            synced: false,
        };

        let stored = record.clone();
        self.mutate(move |snapshot| {
            snapshot.posts.insert(post_id.to_string(), stored);
        })?;

        Ok(record)
    }

    /// Copy of every committed record
    pub fn load_all(&self) -> Result<HashMap<String, ProgressRecord>, StateStoreError> {
        let snapshot = self.snapshot.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(snapshot
            .posts
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }

    pub fn cursor(&self, account_id: &str) -> Result<Option<String>, StateStoreError> {
        let snapshot = self.snapshot.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(snapshot.cursors.get(account_id).cloned())
    }

    pub fn set_cursor(&self, account_id: &str, cursor: &str) -> Result<(), StateStoreError> {
        self.mutate(|snapshot| {
            snapshot
                .cursors
                .insert(account_id.to_string(), cursor.to_string());
        })
    }

    pub fn clear_cursor(&self, account_id: &str) -> Result<(), StateStoreError> {
        if self.cursor(account_id)?.is_none() {
            return Ok(());
        }
        self.mutate(|snapshot| {
            snapshot.cursors.remove(account_id);
        })
    }

    /// Committed rows the row store has not accepted yet
    pub fn unsynced_rows(&self) -> Result<Vec<AggregatedRow>, StateStoreError> {
        let snapshot = self.snapshot.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(snapshot
            .posts
            .values()
            .filter(|record| !record.synced)
            .map(|record| record.row.clone())
            .collect())
    }

    /// Flag rows as accepted by the row store and stamp the batch time
    ///
    /// A record re-committed with a different row since the batch was
    /// built keeps its unsynced flag.
    pub fn mark_synced(
        &self,
        rows: &[AggregatedRow],
        written_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        let checksums = rows
            .iter()
            .map(|row| row.checksum().map(|checksum| (row.post_id.as_str(), checksum)))
            .collect::<Result<HashMap<&str, String>, _>>()?;

        self.mutate(|snapshot| {
            for (post_id, checksum) in &checksums {
                if let Some(record) = snapshot.posts.get_mut(*post_id) {
                    if &record.checksum == checksum {
                        record.synced = true;
                    }
                }
            }
            snapshot.last_batch_write = Some(written_at);
        })
    }

    pub fn last_batch_write(&self) -> Result<Option<DateTime<Utc>>, StateStoreError> {
        let snapshot = self.snapshot.read().map_err(|_| StateStoreError::Poisoned)?;
        Ok(snapshot.last_batch_write)
    }

    /// Apply `change` to a copy of the snapshot, persist it, then publish it
    fn mutate<F>(&self, change: F) -> Result<(), StateStoreError>
    where
        F: FnOnce(&mut StateSnapshot),
    {
        let _writer = self.writer.lock().map_err(|_| StateStoreError::Poisoned)?;

        let mut next = self
            .snapshot
            .read()
            .map_err(|_| StateStoreError::Poisoned)?
            .clone();
        change(&mut next);

        let temp = write_temp_snapshot(&self.path, &next)?;
        replace_with(temp, &self.path)?;

        *self.snapshot.write().map_err(|_| StateStoreError::Poisoned)? = next;
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StateStoreError {
    StateStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn state_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Load a snapshot file; a missing file is an empty snapshot
pub fn load_snapshot(path: &Path) -> Result<StateSnapshot, StateStoreError> {
    if !path.exists() {
        log::info!("No existing state file found: {}", path.display());
        return Ok(StateSnapshot::default());
    }

    let json = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let snapshot: StateSnapshot = serde_json::from_str(&json).map_err(|e| StateStoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StateStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: snapshot.version,
        });
    }

    Ok(snapshot)
}

/// Write the full snapshot to a synced temp file next to `path`
fn write_temp_snapshot(path: &Path, snapshot: &StateSnapshot) -> Result<TempPath, StateStoreError> {
    let dir = state_dir(path);
    fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

    let json = serde_json::to_vec_pretty(snapshot)?;
    let mut temp = NamedTempFile::new_in(&dir).map_err(|e| io_error(&dir, e))?;
    temp.write_all(&json).map_err(|e| io_error(temp.path(), e))?;
    temp.as_file().sync_all().map_err(|e| io_error(temp.path(), e))?;

    Ok(temp.into_temp_path())
}

/// Atomically rename the temp snapshot over `path`
fn replace_with(temp: TempPath, path: &Path) -> Result<(), StateStoreError> {
    temp.persist(path).map_err(|e| io_error(path, e.error))?;

    // Make the rename itself durable where the platform allows it
    if let Ok(dir) = OpenOptions::new().read(true).open(state_dir(path)) {
        let _ = dir.sync_all();
    }

    log::debug!("Saved state snapshot to {}", path.display());
    Ok(())
}

/// Exclusive marker preventing overlapping runs on the same state file
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Lock path used for a given state file
    pub fn path_for(state_file: &Path) -> PathBuf {
        let mut name = state_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        state_file.with_file_name(name)
    }

    /// Take the lock unless a live one exists
    ///
    /// A lock older than `max_age` belongs to a dead run and is taken
    /// over. Returns `Ok(None)` while another run holds it.
    pub fn try_acquire(
        state_file: &Path,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, StateStoreError> {
        let path = Self::path_for(state_file);
        let dir = state_dir(&path);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        match Self::create(&path, now) {
            Ok(lock) => return Ok(Some(lock)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(io_error(&path, e)),
        }

        let observed = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            // Released between our create and read
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_error(&path, e)),
        };

        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let stale = match lock_stamp(&observed) {
            Some(since) => now.signed_duration_since(since) >= max_age,
            None => true,
        };

        if !stale {
            return Ok(None);
        }
        Self::take_over(&path, &observed, now)
    }

    /// Replace a lock whose contents were `observed` as stale
    ///
    /// The lock is first renamed to a private claim path so only one
    /// contender can remove a given lock file. If the claimed file is no
    /// longer the one observed, another run already took over and its
    /// lock is linked back into place.
    fn take_over(path: &Path, observed: &str, now: DateTime<Utc>) -> Result<Option<Self>, StateStoreError> {
        let dir = state_dir(path);
        let claim = tempfile::Builder::new()
            .prefix(".lock-claim")
            .tempfile_in(&dir)
            .map_err(|e| io_error(&dir, e))?
            .into_temp_path();

        match fs::rename(path, &claim) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(path, e)),
        }

        let claimed = fs::read_to_string(&claim).unwrap_or_default();
        if !claimed.is_empty() && claimed != observed {
            if let Err(e) = fs::hard_link(&claim, path) {
                log::warn!("Failed to restore run lock {}: {}", path.display(), e);
            }
            return Ok(None);
        }

        log::warn!("Taking over stale run lock {}", path.display());
        match Self::create(path, now) {
            Ok(lock) => Ok(Some(lock)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(io_error(path, e)),
        }
    }

    fn create(path: &Path, now: DateTime<Utc>) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let nonce: u64 = rand::random();
        write!(file, "{}\n{:016x}", now.to_rfc3339(), nonce)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// Acquisition time written on the first line of a lock file
fn lock_stamp(raw: &str) -> Option<DateTime<Utc>> {
    let first = raw.lines().next()?;
    DateTime::parse_from_rfc3339(first.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}
