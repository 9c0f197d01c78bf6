//! Database module for the sync service.
//!
//! Holds users, todos and tombstones. A push executes as a single
//! transaction: every mutation in it commits together or not at all.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    Conflict, ConflictReason, DeletedTodo, Mapping, PushRequest, PushTodo, Status, Todo,
};
use crate::server::auth::{self, AuthUser};
use crate::server::merge::{self, Verdict};

/// Thread-safe database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

/// A stored user (token value is never retained, only its hash)
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub token_hash: String,
}

/// Result of a merged push
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub conflicts: Vec<Conflict>,
    pub mappings: Vec<Mapping>,
}

/// Canonical timestamp encoding. Fixed-width UTC so that lexicographic
/// comparison in SQL matches instant comparison.
fn sql_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn status_to_sql(status: Status) -> &'static str {
    match status {
        Status::Open => "open",
        Status::Completed => "completed",
        Status::Canceled => "canceled",
    }
}

fn status_from_sql(status: &str) -> Status {
    match status {
        "completed" => Status::Completed,
        "canceled" => Status::Canceled,
        _ => Status::Open,
    }
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by the test suites.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                token_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Todos table
            CREATE TABLE IF NOT EXISTS todos (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                notes TEXT NOT NULL DEFAULT '',
                due_date TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'open',
                position INTEGER NOT NULL DEFAULT 0,
                edited_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                created_by TEXT NOT NULL REFERENCES users(id),
                updated_by TEXT NOT NULL REFERENCES users(id)
            );

            -- Tombstones for deleted todos; at most one per server id
            CREATE TABLE IF NOT EXISTS tombstones (
                server_id TEXT PRIMARY KEY,
                deleted_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                deleted_by TEXT NOT NULL REFERENCES users(id)
            );

            -- Indexes for the delta queries
            CREATE INDEX IF NOT EXISTS idx_todos_updated ON todos(updated_at);
            CREATE INDEX IF NOT EXISTS idx_tombstones_recorded ON tombstones(recorded_at);
            "#,
        )?;

        Ok(())
    }

    // --- users ---

    pub fn create_user(&self, id: &str, name: &str, token_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, name, token_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, token_hash, sql_ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, token_hash FROM users ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                token_hash: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Remove a user by name. Returns false if no such user existed.
    pub fn remove_user(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM users WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    /// Resolve a bearer token to the user it was issued to.
    pub fn user_for_token(&self, token: &str) -> Result<Option<AuthUser>> {
        for user in self.list_users()? {
            if auth::verify_token(token, &user.token_hash) {
                return Ok(Some(AuthUser {
                    id: user.id,
                    name: user.name,
                }));
            }
        }
        Ok(None)
    }

    // --- sync ---

    /// Full state, for bootstrap syncs.
    pub fn state(&self) -> Result<(Vec<Todo>, DateTime<Utc>)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TODO_COLUMNS} FROM todos ORDER BY position, id"
        ))?;
        let todos = collect_todos(&mut stmt, [])?;
        Ok((todos, Utc::now()))
    }

    /// Incremental changes since a client cursor.
    ///
    /// Tombstones are filtered on `recorded_at` (server time), not
    /// `deleted_at` (client time), so backdated deletes still propagate.
    pub fn delta(&self, since: DateTime<Utc>) -> Result<(Vec<Todo>, Vec<DeletedTodo>, DateTime<Utc>)> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(&format!(
            "SELECT {TODO_COLUMNS} FROM todos WHERE updated_at > ?1"
        ))?;
        let upserted = collect_todos(&mut stmt, params![sql_ts(&since)])?;

        let mut stmt = conn
            .prepare("SELECT server_id, deleted_at FROM tombstones WHERE recorded_at > ?1")?;
        let deleted = stmt
            .query_map(params![sql_ts(&since)], |row| {
                Ok(DeletedTodo {
                    server_id: row.get(0)?,
                    deleted_at: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((upserted, deleted, Utc::now()))
    }

    /// Apply a batched push from one client as a single transaction.
    ///
    /// Conflicts are data, not errors: a rejected mutation lands in the
    /// outcome and the push still commits.
    pub fn apply_push(&self, user: &AuthUser, request: &PushRequest) -> Result<PushOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut outcome = PushOutcome::default();
        // Server ids resolved so far in this push; a content match never
        // reuses a record another upsert of the same batch already targets.
        let mut taken: BTreeSet<String> = BTreeSet::new();

        for incoming in &request.todos.upserted {
            let (server_id, provided) = match &incoming.server_id {
                Some(id) => (id.clone(), true),
                None => match find_content_match(&tx, incoming, request.last_synced_at, &taken)? {
                    Some(existing) => (existing, false),
                    None => (Uuid::new_v4().to_string(), false),
                },
            };
            taken.insert(server_id.clone());

            if !provided && let Some(client_id) = &incoming.client_id {
                outcome.mappings.push(Mapping {
                    server_id: server_id.clone(),
                    client_id: client_id.clone(),
                });
            }

            // A live tombstone gates the upsert: only a strictly newer edit
            // resurrects the record.
            if let Some((dead_at, dead_by)) = get_tombstone(&tx, &server_id)? {
                match merge::decide(incoming.edited_at, &user.id, dead_at, &dead_by) {
                    Verdict::Accept => {
                        tx.execute(
                            "DELETE FROM tombstones WHERE server_id = ?1",
                            params![&server_id],
                        )?;
                    }
                    Verdict::Replay | Verdict::Reject => {
                        outcome.conflicts.push(Conflict {
                            server_id,
                            reason: ConflictReason::RemoteDeleteNewer,
                            server_todo: None,
                            client_todo: Some(incoming.clone()),
                            client_deleted_at: None,
                        });
                        continue;
                    }
                }
            }

            match get_todo(&tx, &server_id)? {
                Some(stored) => {
                    match merge::decide(
                        incoming.edited_at,
                        &user.id,
                        stored.edited_at,
                        &stored.updated_by,
                    ) {
                        Verdict::Accept => {
                            tx.execute(
                                r#"UPDATE todos SET title = ?2, notes = ?3, due_date = ?4,
                                   tags = ?5, status = ?6, position = ?7, edited_at = ?8,
                                   updated_at = ?9, updated_by = ?10
                                   WHERE id = ?1"#,
                                params![
                                    &server_id,
                                    &incoming.title,
                                    &incoming.notes,
                                    &incoming.due_date,
                                    serde_json::to_string(&incoming.tags)?,
                                    status_to_sql(incoming.status),
                                    incoming.position,
                                    sql_ts(&incoming.edited_at),
                                    sql_ts(&now),
                                    &user.id,
                                ],
                            )?;
                        }
                        // An exact replay of the stored write: leave the row
                        // (and its delta cursor) untouched.
                        Verdict::Replay => {}
                        Verdict::Reject => {
                            outcome.conflicts.push(Conflict {
                                server_id,
                                reason: ConflictReason::RemoteEditNewer,
                                server_todo: Some(stored),
                                client_todo: Some(incoming.clone()),
                                client_deleted_at: None,
                            });
                        }
                    }
                }
                None => {
                    tx.execute(
                        r#"INSERT INTO todos (id, title, notes, due_date, tags, status,
                           position, edited_at, updated_at, created_by, updated_by)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                        params![
                            &server_id,
                            &incoming.title,
                            &incoming.notes,
                            &incoming.due_date,
                            serde_json::to_string(&incoming.tags)?,
                            status_to_sql(incoming.status),
                            incoming.position,
                            sql_ts(&incoming.edited_at),
                            sql_ts(&now),
                            &user.id,
                            &user.id,
                        ],
                    )?;
                }
            }
        }

        for deletion in &request.todos.deleted {
            match get_todo(&tx, &deletion.server_id)? {
                Some(stored) => {
                    match merge::decide(
                        deletion.deleted_at,
                        &user.id,
                        stored.edited_at,
                        &stored.updated_by,
                    ) {
                        Verdict::Accept => {
                            tx.execute(
                                "DELETE FROM todos WHERE id = ?1",
                                params![&deletion.server_id],
                            )?;
                            tx.execute(
                                r#"INSERT OR REPLACE INTO tombstones
                                   (server_id, deleted_at, recorded_at, deleted_by)
                                   VALUES (?1, ?2, ?3, ?4)"#,
                                params![
                                    &deletion.server_id,
                                    sql_ts(&deletion.deleted_at),
                                    sql_ts(&now),
                                    &user.id,
                                ],
                            )?;
                        }
                        Verdict::Replay | Verdict::Reject => {
                            outcome.conflicts.push(Conflict {
                                server_id: deletion.server_id.clone(),
                                reason: ConflictReason::RemoteEditNewer,
                                server_todo: Some(stored),
                                client_todo: None,
                                client_deleted_at: Some(deletion.deleted_at),
                            });
                        }
                    }
                }
                None => {
                    // No record to fight over; keep the newest tombstone only.
                    let keep = match get_tombstone(&tx, &deletion.server_id)? {
                        Some((existing_at, _)) => deletion.deleted_at > existing_at,
                        None => true,
                    };
                    if keep {
                        tx.execute(
                            r#"INSERT OR REPLACE INTO tombstones
                               (server_id, deleted_at, recorded_at, deleted_by)
                               VALUES (?1, ?2, ?3, ?4)"#,
                            params![
                                &deletion.server_id,
                                sql_ts(&deletion.deleted_at),
                                sql_ts(&now),
                                &user.id,
                            ],
                        )?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Drop all todos and tombstones. Returns the number of todos removed.
    pub fn reset(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let todos = conn.execute("DELETE FROM todos", [])?;
        conn.execute("DELETE FROM tombstones", [])?;
        Ok(todos as u64)
    }
}

const TODO_COLUMNS: &str =
    "id, title, notes, due_date, tags, status, position, edited_at, updated_at, created_by, updated_by";

fn collect_todos<P: rusqlite::Params>(
    stmt: &mut rusqlite::Statement,
    params: P,
) -> Result<Vec<Todo>> {
    let rows = stmt.query_map(params, |row| {
        let tags_json: String = row.get(4)?;
        let status_str: String = row.get(5)?;
        Ok(Todo {
            id: row.get(0)?,
            title: row.get(1)?,
            notes: row.get(2)?,
            due_date: row.get(3)?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            status: status_from_sql(&status_str),
            position: row.get(6)?,
            edited_at: row.get(7)?,
            updated_at: row.get(8)?,
            created_by: row.get(9)?,
            updated_by: row.get(10)?,
        })
    })?;

    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn get_todo(conn: &Connection, server_id: &str) -> Result<Option<Todo>> {
    let mut stmt = conn.prepare(&format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1"))?;
    let mut todos = collect_todos(&mut stmt, params![server_id])?;
    Ok(todos.pop())
}

/// Resolve a serverId-less upsert against an existing record with identical
/// content.
///
/// This is how a device that lost its snapshot mid-cycle re-joins its own
/// record instead of minting a twin. Only records updated past the pushing
/// client's cursor qualify: anything older the device has already seen, so
/// an identical-looking new item there is genuinely a second todo. The match
/// must be unambiguous; with two identical candidates a fresh id is used.
fn find_content_match(
    conn: &Connection,
    incoming: &PushTodo,
    cursor: DateTime<Utc>,
    taken: &BTreeSet<String>,
) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT id, tags FROM todos
         WHERE title = ?1 AND notes = ?2 AND due_date IS ?3 AND status = ?4 AND updated_at > ?5",
    )?;
    let rows = stmt.query_map(
        params![
            &incoming.title,
            &incoming.notes,
            &incoming.due_date,
            status_to_sql(incoming.status),
            sql_ts(&cursor),
        ],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    )?;

    let want: BTreeSet<&str> = incoming.tags.iter().map(String::as_str).collect();
    let mut matches: Vec<String> = Vec::new();
    for row in rows {
        let (id, tags_json) = row?;
        if taken.contains(&id) {
            continue;
        }
        let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
        if tags.iter().map(String::as_str).collect::<BTreeSet<_>>() == want {
            matches.push(id);
        }
    }
    if matches.len() == 1 { Ok(matches.pop()) } else { Ok(None) }
}

fn get_tombstone(conn: &Connection, server_id: &str) -> Result<Option<(DateTime<Utc>, String)>> {
    conn.query_row(
        "SELECT deleted_at, deleted_by FROM tombstones WHERE server_id = ?1",
        params![server_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Into::into)
}
