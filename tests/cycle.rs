//! End-to-end sync cycles: real engine, real file host adapter, real store,
//! with the HTTP layer swapped for an in-process transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use taskdeck_sync::client::apply::ApplyOptions;
use taskdeck_sync::client::conflicts::{ConflictEntry, ConflictKind};
use taskdeck_sync::client::host::{HostApp, HostFields, JsonFileHost};
use taskdeck_sync::client::transport::{Transport, TransportError};
use taskdeck_sync::client::{CycleOutcome, CycleReport, SyncEngine, SyncError};
use taskdeck_sync::models::{
    DeltaBatch, DeltaResponse, HealthResponse, PushRequest, PushResponse, ResetResponse,
    StateResponse,
};
use taskdeck_sync::server::auth::AuthUser;
use taskdeck_sync::server::store::Database;

/// The five endpoints, served straight from the store.
struct LocalTransport {
    db: Arc<Database>,
    user: AuthUser,
}

fn internal(err: anyhow::Error) -> TransportError {
    TransportError::Status {
        status: 500,
        body: err.to_string(),
    }
}

impl Transport for LocalTransport {
    fn health(&self) -> Result<HealthResponse, TransportError> {
        Ok(HealthResponse {
            status: "ok".into(),
            timestamp: Utc::now(),
        })
    }

    fn state(&self) -> Result<StateResponse, TransportError> {
        let (todos, synced_at) = self.db.state().map_err(internal)?;
        Ok(StateResponse { todos, synced_at })
    }

    fn delta(&self, since: DateTime<Utc>) -> Result<DeltaResponse, TransportError> {
        let (upserted, deleted, synced_at) = self.db.delta(since).map_err(internal)?;
        Ok(DeltaResponse {
            todos: DeltaBatch { upserted, deleted },
            synced_at,
        })
    }

    fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        let outcome = self.db.apply_push(&self.user, request).map_err(internal)?;
        let (todos, synced_at) = self.db.state().map_err(internal)?;
        Ok(PushResponse {
            state: StateResponse { todos, synced_at },
            conflicts: outcome.conflicts,
            mappings: outcome.mappings,
        })
    }

    fn reset(&self) -> Result<ResetResponse, TransportError> {
        let todos = self.db.reset().map_err(internal)?;
        Ok(ResetResponse {
            success: true,
            deleted: taskdeck_sync::models::ResetCounts { todos },
        })
    }
}

struct Device {
    _dir: TempDir,
    board: PathBuf,
    state_dir: PathBuf,
    engine: SyncEngine<JsonFileHost, LocalTransport>,
}

impl Device {
    fn new(db: &Arc<Database>, user_id: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let board = dir.path().join("board.json");
        let state_dir = dir.path().join("sync");
        let transport = LocalTransport {
            db: db.clone(),
            user: AuthUser {
                id: user_id.into(),
                name: user_id.into(),
            },
        };
        let engine = SyncEngine::new(&state_dir, "inbox", JsonFileHost::new(&board), transport)
            .with_apply_options(ApplyOptions {
                create_attempts: 3,
                create_backoff: Duration::ZERO,
            });
        Self {
            _dir: dir,
            board,
            state_dir,
            engine,
        }
    }

    fn cycle(&mut self) -> CycleReport {
        // Device clocks tick between user actions; keep edit stamps ordered.
        std::thread::sleep(Duration::from_millis(5));
        match self.engine.run_cycle().unwrap() {
            CycleOutcome::Completed(report) => report,
            CycleOutcome::Skipped => panic!("cycle unexpectedly skipped"),
        }
    }

    fn titles(&self) -> Vec<String> {
        JsonFileHost::new(&self.board)
            .list_todos("inbox")
            .unwrap()
            .into_iter()
            .map(|todo| todo.title)
            .collect()
    }

    fn create(&self, title: &str) {
        JsonFileHost::new(&self.board)
            .create_todo(
                "inbox",
                &HostFields {
                    title: title.into(),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    fn edit_board<F: FnOnce(&mut Vec<serde_json::Value>)>(&self, mutate: F) {
        let raw = std::fs::read_to_string(&self.board).unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let items = doc
            .pointer_mut("/projects/inbox")
            .and_then(|v| v.as_array_mut())
            .expect("board has an inbox");
        let mut owned = std::mem::take(items);
        mutate(&mut owned);
        *items = owned;
        std::fs::write(&self.board, doc.to_string()).unwrap();
    }

    fn remove(&self, title: &str) {
        self.edit_board(|items| items.retain(|item| item["title"] != title));
    }

    fn rename(&self, from: &str, to: &str) {
        self.edit_board(|items| {
            for item in items {
                if item["title"] == from {
                    item["title"] = serde_json::Value::String(to.into());
                }
            }
        });
    }

    fn mappings(&self) -> Vec<(String, String)> {
        let raw = std::fs::read_to_string(self.state_dir.join("state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        doc["serverIdToLocalId"]
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().unwrap().to_string()))
            .collect()
    }

    fn conflict_kinds(&self) -> Vec<ConflictKind> {
        let Ok(raw) = std::fs::read_to_string(self.state_dir.join("conflicts.json")) else {
            return Vec::new();
        };
        let entries: Vec<ConflictEntry> = serde_json::from_str(&raw).unwrap();
        entries.into_iter().map(|entry| entry.kind).collect()
    }
}

fn service() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.create_user("user-A", "alice", "hash-a").unwrap();
    db.create_user("user-B", "bob", "hash-b").unwrap();
    Arc::new(db)
}

/// The registry stays a bijection: every server id and local id appears once.
fn assert_bijective(mappings: &[(String, String)]) {
    let mut servers: Vec<&str> = mappings.iter().map(|(s, _)| s.as_str()).collect();
    let mut locals: Vec<&str> = mappings.iter().map(|(_, l)| l.as_str()).collect();
    servers.sort_unstable();
    locals.sort_unstable();
    servers.dedup();
    locals.dedup();
    assert_eq!(servers.len(), mappings.len());
    assert_eq!(locals.len(), mappings.len());
}

#[test]
fn first_sync_bootstraps_from_full_state() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");
    alice.create("pay rent");
    alice.create("water plants");
    let report = alice.cycle();
    assert_eq!(report.pushed_upserts, 2);

    // A fresh device with an empty board pulls the full state.
    let mut bob = Device::new(&db, "user-B");
    let report = bob.cycle();
    assert!(report.bootstrapped);
    assert_eq!(report.pulled_upserts, 2);

    let mut titles = bob.titles();
    titles.sort();
    assert_eq!(titles, vec!["pay rent", "water plants"]);
    let mappings = bob.mappings();
    assert_eq!(mappings.len(), 2);
    assert_bijective(&mappings);

    // Nothing changed: the follow-up cycle pushes nothing and pulls nothing.
    let report = bob.cycle();
    assert!(!report.bootstrapped);
    assert_eq!(report.pushed_upserts + report.pushed_deletes, 0);
    assert_eq!(report.pulled_upserts + report.pulled_deletes, 0);
}

#[test]
fn edits_propagate_between_devices() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");
    let mut bob = Device::new(&db, "user-B");

    alice.create("draft report");
    alice.cycle();
    bob.cycle();
    assert_eq!(bob.titles(), vec!["draft report"]);

    bob.rename("draft report", "draft and send report");
    bob.cycle();
    let report = alice.cycle();
    assert_eq!(report.pulled_upserts, 1);
    assert_eq!(alice.titles(), vec!["draft and send report"]);

    assert_bijective(&alice.mappings());
    assert_bijective(&bob.mappings());
    assert!(alice.conflict_kinds().is_empty());
    assert!(bob.conflict_kinds().is_empty());
}

#[test]
fn remote_delete_is_reported_not_executed() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");
    let mut bob = Device::new(&db, "user-B");

    alice.create("shared chore");
    alice.cycle();
    bob.cycle();

    alice.remove("shared chore");
    let report = alice.cycle();
    assert_eq!(report.pushed_deletes, 1);
    // Alice's own mapping settles silently.
    assert!(alice.mappings().is_empty());

    let report = bob.cycle();
    assert_eq!(report.pulled_deletes, 1);
    // The host app cannot be deleted from: the item stays, the log records it.
    assert_eq!(bob.titles(), vec!["shared chore"]);
    assert_eq!(bob.conflict_kinds(), vec![ConflictKind::DeleteAcknowledged]);
    assert_eq!(bob.mappings().len(), 1);

    // Bob removes it by hand; the next cycles settle without conflicts.
    bob.remove("shared chore");
    bob.cycle();
    let report = bob.cycle();
    assert_eq!(report.pushed_upserts + report.pushed_deletes, 0);
    assert!(bob.mappings().is_empty());
    assert_eq!(bob.conflict_kinds(), vec![ConflictKind::DeleteAcknowledged]);
}

#[test]
fn newer_edit_resurrects_a_remote_delete() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");
    let mut bob = Device::new(&db, "user-B");

    alice.create("contested item");
    alice.cycle();
    bob.cycle();

    bob.remove("contested item");
    bob.cycle();

    // Alice edits after Bob's delete; her edit is newer and wins.
    alice.rename("contested item", "contested but alive");
    alice.cycle();
    assert!(alice.conflict_kinds().is_empty());
    assert_eq!(alice.titles(), vec!["contested but alive"]);

    // Bob gets the item back.
    let report = bob.cycle();
    assert_eq!(report.pulled_upserts, 1);
    assert_eq!(bob.titles(), vec!["contested but alive"]);
    assert_bijective(&bob.mappings());
}

#[test]
fn older_push_yields_a_conflict_entry() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");
    let mut bob = Device::new(&db, "user-B");

    alice.create("tug of war");
    alice.cycle();
    bob.cycle();

    bob.rename("tug of war", "bob version");
    bob.cycle();

    // Alice edited before Bob did, but her push never went through (flaky
    // network); her device retries the cycle with the old edit stamp intact.
    alice.rename("tug of war", "alice version");
    let (_, local_id) = alice.mappings().into_iter().next().unwrap();
    let state_path = alice.state_dir.join("state.json");
    let raw = std::fs::read_to_string(&state_path).unwrap();
    let mut doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    doc["todos"][&local_id]["title"] = serde_json::json!("alice version");
    doc["todos"][&local_id]["editedAt"] = serde_json::json!("2020-01-01T00:00:00Z");
    doc["dirty"]["upserted"] = serde_json::json!([local_id]);
    std::fs::write(&state_path, doc.to_string()).unwrap();

    let report = alice.cycle();
    assert_eq!(report.pushed_upserts, 1);
    assert_eq!(report.new_conflicts, 1);
    assert_eq!(alice.conflict_kinds(), vec![ConflictKind::RemoteEditNewer]);
    // The pull in the same cycle replaces her copy with Bob's.
    assert_eq!(alice.titles(), vec!["bob version"]);
}

#[test]
fn interrupted_cycle_settles_without_duplicates() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");
    alice.create("crash test");
    alice.cycle();

    // Crash simulation: the host board kept the synced item but the snapshot
    // persist never happened.
    std::fs::remove_file(alice.state_dir.join("state.json")).unwrap();

    // The item is re-detected as a new local insertion and re-pushed without
    // a server id. The device's cursor predates the record, so the server
    // recognizes the content and reuses the record instead of minting a twin.
    let report = alice.cycle();
    assert_eq!(report.pushed_upserts, 1);
    assert_eq!(report.new_conflicts, 0);

    assert_eq!(alice.titles(), vec!["crash test"]);
    let mappings = alice.mappings();
    assert_eq!(mappings.len(), 1);
    assert_bijective(&mappings);

    // The server holds a single record too, and the state is stable.
    let (todos, _) = db.state().unwrap();
    assert_eq!(todos.len(), 1);
    let report = alice.cycle();
    assert_eq!(report.pushed_upserts + report.pushed_deletes, 0);
    assert_eq!(report.new_conflicts, 0);
    assert_eq!(alice.titles(), vec!["crash test"]);
}

#[test]
fn cycle_is_skipped_while_the_lock_is_held() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");
    std::fs::create_dir_all(&alice.state_dir).unwrap();
    std::fs::write(
        alice.state_dir.join("sync.lock"),
        std::process::id().to_string(),
    )
    .unwrap();

    match alice.engine.run_cycle().unwrap() {
        CycleOutcome::Skipped => {}
        CycleOutcome::Completed(_) => panic!("lock was ignored"),
    }
}

#[test]
fn corrupt_snapshot_halts_the_cycle() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");
    alice.create("anything");
    alice.cycle();

    std::fs::write(alice.state_dir.join("state.json"), "{ broken").unwrap();
    let err = alice.engine.run_cycle().unwrap_err();
    assert!(matches!(err, SyncError::CorruptState(_)));
    assert!(err.is_fatal());
    // The failed cycle released the lock.
    assert!(!alice.state_dir.join("sync.lock").exists());
}

#[test]
fn last_synced_at_never_goes_backwards() {
    let db = service();
    let mut alice = Device::new(&db, "user-A");

    let cursor = |device: &Device| -> DateTime<Utc> {
        let raw = std::fs::read_to_string(device.state_dir.join("state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        doc["lastSyncedAt"]
            .as_str()
            .unwrap()
            .parse::<DateTime<Utc>>()
            .unwrap()
    };

    alice.create("tick");
    alice.cycle();
    let first = cursor(&alice);
    alice.cycle();
    let second = cursor(&alice);
    alice.rename("tick", "tock");
    alice.cycle();
    let third = cursor(&alice);

    assert!(second >= first);
    assert!(third >= second);
}
