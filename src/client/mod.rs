//! Device-side sync core.
//!
//! One `SyncEngine` per device runs the cycle: lock, load snapshot, read the
//! host app, detect changes, push, pull, apply, persist, unlock. Cycles are
//! scheduled by the caller (a timer in daemon mode, once in manual mode).

pub mod apply;
pub mod conflicts;
pub mod detect;
pub mod host;
pub mod lock;
pub mod registry;
pub mod snapshot;
pub mod transport;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use crate::models::{PushBatch, PushDelete, PushRequest, PushTodo};
use self::apply::ApplyOptions;
use self::conflicts::{ConflictEntry, ConflictLog};
use self::host::HostApp;
use self::lock::SyncLock;
use self::snapshot::{DeviceState, Dirty, SnapshotStore};
use self::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum SyncError {
    /// The snapshot cannot be trusted. Never auto-repaired.
    #[error("device snapshot is corrupt: {0}")]
    CorruptState(String),
    /// Binding would break the server-id/local-id bijection.
    #[error(transparent)]
    DuplicateMapping(#[from] registry::DuplicateMapping),
    #[error("server rejected credentials")]
    Unauthorized,
    #[error("transport: {0}")]
    Transport(TransportError),
    #[error(transparent)]
    HostApp(#[from] host::HostError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized => Self::Unauthorized,
            other => Self::Transport(other),
        }
    }
}

impl SyncError {
    /// Fatal conditions halt syncing until an operator steps in; everything
    /// else is retried by the next scheduled cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CorruptState(_) | Self::DuplicateMapping(_) | Self::Unauthorized
        )
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Another sync on this device was already running.
    Skipped,
    Completed(CycleReport),
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub pushed_upserts: usize,
    pub pushed_deletes: usize,
    pub pulled_upserts: usize,
    pub pulled_deletes: usize,
    pub new_conflicts: usize,
    pub bootstrapped: bool,
}

pub struct SyncEngine<H, T> {
    project: String,
    state_dir: PathBuf,
    snapshot: SnapshotStore,
    lock: SyncLock,
    conflict_log: ConflictLog,
    host: H,
    transport: T,
    apply_opts: ApplyOptions,
}

impl<H: HostApp, T: Transport> SyncEngine<H, T> {
    pub fn new(state_dir: &Path, project: &str, host: H, transport: T) -> Self {
        Self {
            project: project.to_string(),
            state_dir: state_dir.to_path_buf(),
            snapshot: SnapshotStore::new(state_dir.join("state.json")),
            lock: SyncLock::new(state_dir.join("sync.lock")),
            conflict_log: ConflictLog::new(state_dir.join("conflicts.json")),
            host,
            transport,
            apply_opts: ApplyOptions::default(),
        }
    }

    pub fn with_apply_options(mut self, opts: ApplyOptions) -> Self {
        self.apply_opts = opts;
        self
    }

    pub fn conflict_log(&self) -> &ConflictLog {
        &self.conflict_log
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one full cycle. `Skipped` is not an error; it means another sync
    /// holds the device lock.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, SyncError> {
        fs::create_dir_all(&self.state_dir)?;
        let Some(_guard) = self.lock.acquire()? else {
            tracing::debug!("another sync is running; skipping this cycle");
            return Ok(CycleOutcome::Skipped);
        };
        // The guard removes the lock file on every exit path below.
        let report = self.cycle_locked()?;
        Ok(CycleOutcome::Completed(report))
    }

    fn cycle_locked(&mut self) -> Result<CycleReport, SyncError> {
        let mut state = self.snapshot.load()?;
        self.snapshot.backup()?;

        let readout = self.host.list_todos(&self.project)?;
        let now = Utc::now();
        let summary = detect::detect(&mut state, &readout, now);
        if summary.any() {
            tracing::debug!(
                added = summary.added,
                modified = summary.modified,
                deleted = summary.deleted,
                withdrawn = summary.withdrawn,
                "local changes detected"
            );
        }

        let mut report = CycleReport::default();
        let mut new_conflicts: Vec<ConflictEntry> = Vec::new();

        if let Some(push) = build_push(&state) {
            report.pushed_upserts = push.todos.upserted.len();
            report.pushed_deletes = push.todos.deleted.len();
            let response = self.transport.push(&push)?;

            for mapping in &response.mappings {
                state.registry.bind(&mapping.server_id, &mapping.client_id)?;
            }
            for conflict in &response.conflicts {
                new_conflicts.push(ConflictEntry::from_push(conflict, now));
            }
            state.dirty = Dirty::default();
        }

        // A device that has never seen anything fetches the full state
        // instead of a delta.
        let bootstrap = state.todos.is_empty() && state.registry.is_empty() && readout.is_empty();
        let (upserted, deleted, synced_at) = if bootstrap {
            let full = self.transport.state()?;
            (full.todos, Vec::new(), full.synced_at)
        } else {
            let delta = self.transport.delta(state.last_synced_at)?;
            (delta.todos.upserted, delta.todos.deleted, delta.synced_at)
        };
        report.bootstrapped = bootstrap;
        report.pulled_upserts = upserted.len();
        report.pulled_deletes = deleted.len();

        let applied = apply::apply_delta(
            &mut state,
            &mut self.host,
            &self.project,
            &upserted,
            &deleted,
            now,
            &self.apply_opts,
        )?;
        new_conflicts.extend(applied.conflicts);

        state.last_synced_at = synced_at;
        self.conflict_log.append(&new_conflicts)?;
        self.snapshot.persist(&state)?;

        report.new_conflicts = new_conflicts.len();
        tracing::info!(
            pushed = report.pushed_upserts + report.pushed_deletes,
            pulled = report.pulled_upserts + report.pulled_deletes,
            conflicts = report.new_conflicts,
            "sync cycle complete"
        );
        Ok(report)
    }
}

/// Build the push payload from the dirty set, or nothing when there is
/// nothing to say. A known server id rides along; otherwise the local id is
/// sent as `clientId` so the response mapping can bind it.
fn build_push(state: &DeviceState) -> Option<PushRequest> {
    if state.dirty.is_empty() {
        return None;
    }

    let mut upserted = Vec::new();
    for local_id in &state.dirty.upserted {
        let Some(record) = state.todos.get(local_id) else {
            continue;
        };
        let server_id = state.registry.reverse(local_id).map(str::to_owned);
        upserted.push(PushTodo {
            client_id: server_id.is_none().then(|| local_id.clone()),
            server_id,
            title: record.title.clone(),
            notes: record.notes.clone(),
            due_date: record.due_date,
            tags: record.tags.clone(),
            status: record.status,
            position: record.position,
            edited_at: record.edited_at,
        });
    }

    let deleted = state
        .dirty
        .deleted
        .iter()
        .map(|(server_id, deleted_at)| PushDelete {
            server_id: server_id.clone(),
            deleted_at: *deleted_at,
        })
        .collect();

    Some(PushRequest {
        todos: PushBatch { upserted, deleted },
        last_synced_at: state.last_synced_at,
    })
}
