//! Durable per-user counters and staged-file records.
//!
//! The whole state lives in one JSON snapshot. Every mutation takes the
//! store lock, applies the change to a copy, writes the copy to disk and only
//! then publishes it in memory, so concurrent requests and the expiry sweep
//! never lose each other's updates.

use crate::media_fetcher::MediaMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Snapshot {path} is corrupt: {source}")]
    PersistenceCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Chat identity a staged file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user_id: i64,
    pub chat_id: i64,
}

/// Per-user preference and counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: i64,
    #[serde(default)]
    pub preferred_mode: MediaMode,
    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub qr_count: u64,
    #[serde(default)]
    pub cloud_upload_count: u64,
}

impl UserRecord {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            preferred_mode: MediaMode::default(),
            download_count: 0,
            qr_count: 0,
            cloud_upload_count: 0,
        }
    }
}

/// Lifecycle state of a staged file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Remote object exists and is waiting for expiry
    Active,
    /// Remote object removed (or confirmed gone)
    Deleted,
    /// Deletion gave up after the configured attempt budget
    Abandoned,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordState::Active)
    }
}

/// A file uploaded to remote storage and scheduled for deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedFileRecord {
    pub record_id: String,
    pub remote_object_id: String,
    pub public_url: String,
    pub owner_user_id: i64,
    pub owner_chat_id: i64,
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: RecordState,
    #[serde(default)]
    pub delete_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl StagedFileRecord {
    /// Build an Active record expiring `retention` after `created_at`
    pub fn new(
        file_name: &str,
        remote_object_id: String,
        public_url: String,
        owner: Owner,
        size_bytes: u64,
        created_at: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            record_id: record_id_for(file_name, created_at),
            remote_object_id,
            public_url,
            owner_user_id: owner.user_id,
            owner_chat_id: owner.chat_id,
            file_name: file_name.to_string(),
            size_bytes,
            created_at,
            expires_at: created_at + retention,
            state: RecordState::Active,
            delete_attempts: 0,
            last_error: None,
            closed_at: None,
        }
    }

    /// Active and past its expiry time
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Active && now >= self.expires_at
    }
}

/// Record id derived from the local file name and the upload time
fn record_id_for(file_name: &str, created_at: DateTime<Utc>) -> String {
    let stem: String = file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(48)
        .collect();
    format!("{}_{}", stem, created_at.timestamp_micros())
}

/// Everything the store persists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
    #[serde(default)]
    pub staged_files: BTreeMap<String, StagedFileRecord>,
}

impl Snapshot {
    fn user_mut(&mut self, user_id: i64) -> &mut UserRecord {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserRecord::new(user_id))
    }
}

/// Write-through JSON store guarded by a single async lock
pub struct StateStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl StateStore {
    /// Open the store, starting empty when the snapshot is missing or unreadable
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let snapshot = match load(&path).await {
            Ok(Some(snapshot)) => {
                info!(
                    path = %path.display(),
                    users = snapshot.users.len(),
                    staged_files = snapshot.staged_files.len(),
                    "Loaded state snapshot"
                );
                snapshot
            }
            Ok(None) => {
                info!(path = %path.display(), "No state snapshot found, starting empty");
                Snapshot::default()
            }
            Err(e) => {
                warn!(error = %e, "Discarding unreadable state snapshot, starting empty");
                Snapshot::default()
            }
        };

        Self {
            path,
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Path of the backing snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a mutation and persist the resulting snapshot before publishing it
    pub async fn update<T>(&self, mutate: impl FnOnce(&mut Snapshot) -> T) -> Result<T, StoreError> {
        let mut guard = self.snapshot.lock().await;
        let mut next = guard.clone();
        let out = mutate(&mut next);
        save(&self.path, &next).await?;
        *guard = next;
        Ok(out)
    }

    /// Read from the current snapshot
    pub async fn read<T>(&self, view: impl FnOnce(&Snapshot) -> T) -> T {
        let guard = self.snapshot.lock().await;
        view(&guard)
    }

    /// Preferred download mode for a user (default when unknown)
    pub async fn preference(&self, user_id: i64) -> MediaMode {
        self.read(|s| {
            s.users
                .get(&user_id.to_string())
                .map(|u| u.preferred_mode)
                .unwrap_or_default()
        })
        .await
    }

    pub async fn set_preference(&self, user_id: i64, mode: MediaMode) -> Result<(), StoreError> {
        self.update(|s| s.user_mut(user_id).preferred_mode = mode).await?;
        debug!(user_id, mode = %mode, "Preference updated");
        Ok(())
    }

    /// Count a completed download, returning the new total
    pub async fn record_download(&self, user_id: i64) -> Result<u64, StoreError> {
        self.update(|s| {
            let user = s.user_mut(user_id);
            user.download_count += 1;
            user.download_count
        })
        .await
    }

    /// Count a generated QR code, returning the new total
    pub async fn record_qr(&self, user_id: i64) -> Result<u64, StoreError> {
        self.update(|s| {
            let user = s.user_mut(user_id);
            user.qr_count += 1;
            user.qr_count
        })
        .await
    }

    /// Counters for a user (zeroes when unknown)
    pub async fn user_stats(&self, user_id: i64) -> UserRecord {
        self.read(|s| {
            s.users
                .get(&user_id.to_string())
                .cloned()
                .unwrap_or_else(|| UserRecord::new(user_id))
        })
        .await
    }

    /// Persist a staged record; a new record also bumps the owner's upload counter
    pub async fn insert_staged(&self, record: StagedFileRecord) -> Result<(), StoreError> {
        let record_id = record.record_id.clone();
        let owner = record.owner_user_id;

        let replaced = self
            .update(|s| {
                let replaced = s.staged_files.insert(record.record_id.clone(), record).is_some();
                if !replaced {
                    s.user_mut(owner).cloud_upload_count += 1;
                }
                replaced
            })
            .await?;

        debug!(record_id = %record_id, replaced, "Staged file record stored");
        Ok(())
    }

    pub async fn staged_record(&self, record_id: &str) -> Option<StagedFileRecord> {
        self.read(|s| s.staged_files.get(record_id).cloned()).await
    }

    pub async fn staged_records(&self) -> Vec<StagedFileRecord> {
        self.read(|s| s.staged_files.values().cloned().collect()).await
    }

    /// Active records whose expiry is at or before `now`, oldest first
    pub async fn due_records(&self, now: DateTime<Utc>) -> Vec<StagedFileRecord> {
        let mut due: Vec<StagedFileRecord> = self
            .read(|s| {
                s.staged_files
                    .values()
                    .filter(|r| r.is_due(now))
                    .cloned()
                    .collect()
            })
            .await;
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        due
    }

    /// Close an Active record as Deleted; returns false if it was not Active
    pub async fn mark_deleted(&self, record_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update(|s| match s.staged_files.get_mut(record_id) {
            Some(record) if record.state == RecordState::Active => {
                record.state = RecordState::Deleted;
                record.closed_at = Some(at);
                record.last_error = None;
                true
            }
            _ => false,
        })
        .await
    }

    /// Note a failed deletion; moves the record to Abandoned once the budget is spent
    pub async fn record_delete_failure(
        &self,
        record_id: &str,
        error: &str,
        max_attempts: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<Option<RecordState>, StoreError> {
        self.update(|s| {
            let record = s.staged_files.get_mut(record_id)?;
            if record.state != RecordState::Active {
                return Some(record.state);
            }
            record.delete_attempts += 1;
            record.last_error = Some(error.to_string());
            if max_attempts.is_some_and(|max| record.delete_attempts >= max) {
                record.state = RecordState::Abandoned;
                record.closed_at = Some(at);
            }
            Some(record.state)
        })
        .await
    }

    /// Drop Deleted records closed before `before`; Abandoned records are kept
    pub async fn prune_deleted(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let prunable = |r: &StagedFileRecord| {
            r.state == RecordState::Deleted && r.closed_at.is_some_and(|at| at < before)
        };

        if !self.read(|s| s.staged_files.values().any(prunable)).await {
            return Ok(0);
        }

        let pruned = self
            .update(|s| {
                let len = s.staged_files.len();
                s.staged_files.retain(|_, r| !prunable(&*r));
                len - s.staged_files.len()
            })
            .await?;

        debug!(pruned, "Pruned closed staged file records");
        Ok(pruned)
    }
}

/// Read a snapshot file; `Ok(None)` when it does not exist
pub async fn load(path: &Path) -> Result<Option<Snapshot>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::PersistenceCorrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Write a snapshot next to its destination and rename it into place
pub async fn save(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;

    Ok(())
}
