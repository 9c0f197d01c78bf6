//! Durable device snapshot: the prior host-app view plus sync cursors.
//!
//! The whole device state is one JSON document. Writes go to a sibling temp
//! file, fsync, then rename, so an interrupted cycle never leaves a partial
//! file behind. A `.bak` sidecar is taken before any mutation of a cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::client::SyncError;
use crate::client::registry::IdRegistry;
use crate::models::{Status, Todo};

/// One todo as the device last saw it
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTodo {
    pub title: String,
    pub notes: String,
    pub due_date: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub status: Status,
    pub position: i64,
    pub edited_at: DateTime<Utc>,
}

impl LocalTodo {
    pub fn from_remote(remote: &Todo) -> Self {
        Self {
            title: remote.title.clone(),
            notes: remote.notes.clone(),
            due_date: remote.due_date,
            tags: remote.tags.clone(),
            status: remote.status,
            position: remote.position,
            edited_at: remote.edited_at,
        }
    }
}

/// Pending changes not yet accepted by the server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dirty {
    /// Local ids with an unpushed create or edit.
    pub upserted: BTreeSet<String>,
    /// Server ids with an unpushed deletion, and when it happened.
    pub deleted: BTreeMap<String, DateTime<Utc>>,
}

impl Dirty {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.deleted.is_empty()
    }
}

/// Everything the device persists between cycles
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub last_synced_at: DateTime<Utc>,
    /// Device-local id → last known record.
    pub todos: BTreeMap<String, LocalTodo>,
    pub registry: IdRegistry,
    pub dirty: Dirty,
}

impl DeviceState {
    /// State of a device that has never synced.
    pub fn fresh() -> Self {
        Self {
            last_synced_at: DateTime::UNIX_EPOCH,
            todos: BTreeMap::new(),
            registry: IdRegistry::new(),
            dirty: Dirty::default(),
        }
    }
}

// Persisted form. Record-level fields added after early releases are
// tolerated when missing; the three top-level fields are not.

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredState {
    last_synced_at: DateTime<Utc>,
    todos: BTreeMap<String, StoredTodo>,
    server_id_to_local_id: BTreeMap<String, String>,
    #[serde(default)]
    dirty: StoredDirty,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StoredDirty {
    #[serde(default)]
    upserted: BTreeSet<String>,
    #[serde(default)]
    deleted: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTodo {
    title: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    due_date: Option<NaiveDate>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    status: Status,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    edited_at: Option<DateTime<Utc>>,
}

/// Owns the snapshot file and its sidecars
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Load the device state. A missing file means a fresh device; anything
    /// unreadable refuses the sync rather than silently resetting.
    pub fn load(&self) -> Result<DeviceState, SyncError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DeviceState::fresh());
            }
            Err(err) => return Err(err.into()),
        };

        let stored: StoredState = serde_json::from_str(&raw)
            .map_err(|err| SyncError::CorruptState(format!("{}: {err}", self.path.display())))?;

        let registry = IdRegistry::from_map(stored.server_id_to_local_id)?;

        let last_synced_at = stored.last_synced_at;
        let todos: BTreeMap<String, LocalTodo> = stored
            .todos
            .into_iter()
            .map(|(local_id, record)| {
                (
                    local_id,
                    LocalTodo {
                        title: record.title,
                        notes: record.notes,
                        due_date: record.due_date,
                        tags: record.tags,
                        status: record.status,
                        position: record.position,
                        edited_at: record.edited_at.unwrap_or(last_synced_at),
                    },
                )
            })
            .collect();

        let mut dirty = Dirty {
            upserted: stored.dirty.upserted,
            deleted: stored.dirty.deleted,
        };
        // Pending upserts refer only to records that still exist.
        dirty.upserted.retain(|local_id| todos.contains_key(local_id));

        Ok(DeviceState {
            last_synced_at,
            todos,
            registry,
            dirty,
        })
    }

    /// Copy the live file to the `.bak` sidecar. No-op for a fresh device.
    pub fn backup(&self) -> Result<(), SyncError> {
        if self.path.exists() {
            fs::copy(&self.path, self.sibling(".bak"))?;
        }
        Ok(())
    }

    /// Atomically replace the snapshot: temp file, fsync, rename.
    pub fn persist(&self, state: &DeviceState) -> Result<(), SyncError> {
        let stored = StoredState {
            last_synced_at: state.last_synced_at,
            todos: state
                .todos
                .iter()
                .map(|(local_id, record)| {
                    (
                        local_id.clone(),
                        StoredTodo {
                            title: record.title.clone(),
                            notes: record.notes.clone(),
                            due_date: record.due_date,
                            tags: record.tags.clone(),
                            status: record.status,
                            position: record.position,
                            edited_at: Some(record.edited_at),
                        },
                    )
                })
                .collect(),
            server_id_to_local_id: state.registry.as_map().clone(),
            dirty: StoredDirty {
                upserted: state.dirty.upserted.clone(),
                deleted: state.dirty.deleted.clone(),
            },
        };

        let encoded = serde_json::to_vec_pretty(&stored)
            .map_err(|err| SyncError::CorruptState(format!("could not encode snapshot: {err}")))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.sibling(&format!(".tmp-{}", std::process::id()));
        let mut file = File::create(&tmp)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
