//! Remote applier: bring the host app in line with a server delta.
//!
//! The server has already merged, so an upsert in the delta always wins over
//! whatever the snapshot holds. The only judgment call left on the device is
//! delete-vs-local-edit, because the host app cannot be deleted from
//! programmatically.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::client::SyncError;
use crate::client::conflicts::{ConflictEntry, ConflictKind};
use crate::client::host::{HostApp, HostFields, HostTodo};
use crate::client::snapshot::{DeviceState, LocalTodo};
use crate::models::{DeletedTodo, Status, Todo};

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Readout attempts after a create before giving up on finding the item.
    pub create_attempts: u32,
    pub create_backoff: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            create_attempts: 3,
            create_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    /// Mappings dropped for confirmed remote deletions.
    pub unbound: usize,
    /// Creates whose item never showed up in a readout.
    pub orphaned: usize,
    pub conflicts: Vec<ConflictEntry>,
}

fn fields_for(remote: &Todo, with_status: bool) -> HostFields {
    HostFields {
        title: remote.title.clone(),
        notes: remote.notes.clone(),
        due_date: remote.due_date,
        tags: remote.tags.clone(),
        status: with_status.then_some(remote.status),
    }
}

fn find_created(current: &[HostTodo], before: &BTreeSet<String>, title: &str) -> Option<HostTodo> {
    let candidates: Vec<&HostTodo> = current
        .iter()
        .filter(|item| !before.contains(&item.id) && item.title == title)
        .collect();
    match candidates.len() {
        0 => None,
        1 => Some(candidates[0].clone()),
        n => {
            tracing::warn!(title, candidates = n, "ambiguous create: several new items share this title");
            Some(candidates[0].clone())
        }
    }
}

pub fn apply_delta<H: HostApp>(
    state: &mut DeviceState,
    host: &mut H,
    project: &str,
    upserted: &[Todo],
    deleted: &[DeletedTodo],
    now: DateTime<Utc>,
    opts: &ApplyOptions,
) -> Result<ApplyReport, SyncError> {
    let mut report = ApplyReport::default();

    for remote in upserted {
        match state.registry.get(&remote.id).map(str::to_owned) {
            Some(local_id) => {
                host.update_todo(project, &local_id, &fields_for(remote, true))?;
                state
                    .todos
                    .insert(local_id, LocalTodo::from_remote(remote));
                report.updated += 1;
            }
            None => {
                let before = host.list_todos(project)?;
                host.create_todo(project, &fields_for(remote, false))?;

                let before_ids: BTreeSet<String> =
                    before.iter().map(|item| item.id.clone()).collect();
                let mut found = None;
                for attempt in 0..opts.create_attempts {
                    let current = host.list_todos(project)?;
                    found = find_created(&current, &before_ids, &remote.title);
                    if found.is_some() {
                        break;
                    }
                    if attempt + 1 < opts.create_attempts {
                        std::thread::sleep(opts.create_backoff);
                    }
                }

                match found {
                    Some(item) => {
                        state.registry.bind(&remote.id, &item.id)?;
                        if remote.status != Status::Open {
                            host.update_todo(project, &item.id, &fields_for(remote, true))?;
                        }
                        state
                            .todos
                            .insert(item.id.clone(), LocalTodo::from_remote(remote));
                        report.created += 1;
                    }
                    None => {
                        tracing::warn!(
                            server_id = %remote.id,
                            title = %remote.title,
                            "created item not found in the host app after retries"
                        );
                        report.orphaned += 1;
                    }
                }
            }
        }
    }

    for tombstone in deleted {
        let Some(local_id) = state.registry.get(&tombstone.server_id).map(str::to_owned) else {
            continue;
        };
        match state.todos.get(&local_id) {
            // Already gone on the device too; settle silently.
            None => {
                state.registry.unbind(&tombstone.server_id);
                report.unbound += 1;
            }
            Some(local) if local.edited_at > tombstone.deleted_at => {
                report.conflicts.push(ConflictEntry {
                    logged_at: now,
                    server_id: tombstone.server_id.clone(),
                    kind: ConflictKind::DeleteVsLocalEdit,
                    detail: format!(
                        "'{}' was edited locally at {} after the remote delete at {}",
                        local.title, local.edited_at, tombstone.deleted_at
                    ),
                });
            }
            Some(local) => {
                report.conflicts.push(ConflictEntry {
                    logged_at: now,
                    server_id: tombstone.server_id.clone(),
                    kind: ConflictKind::DeleteAcknowledged,
                    detail: format!("'{}' was deleted on the server; remove it in Taskdeck to finish", local.title),
                });
            }
        }
    }

    Ok(report)
}
