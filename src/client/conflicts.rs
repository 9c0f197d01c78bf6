//! Append-only conflict log.
//!
//! Every rejection the server reports and every delete-vs-local-edit the
//! applier sees lands here, stamped with a local timestamp. The file is
//! replaced via temp-and-rename so concurrent readers never see a torn list.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::SyncError;
use crate::models::{Conflict, ConflictReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// The server kept a newer edit over ours.
    RemoteEditNewer,
    /// The server kept a newer delete over our edit.
    RemoteDeleteNewer,
    /// The server deleted an item we edited afterwards; the host app keeps it.
    DeleteVsLocalEdit,
    /// The server deleted an item; device-side removal is up to the user.
    DeleteAcknowledged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub logged_at: DateTime<Utc>,
    pub server_id: String,
    pub kind: ConflictKind,
    pub detail: String,
}

impl ConflictEntry {
    /// Translate a push-response conflict into a log entry.
    pub fn from_push(conflict: &Conflict, logged_at: DateTime<Utc>) -> Self {
        let kind = match conflict.reason {
            ConflictReason::RemoteEditNewer => ConflictKind::RemoteEditNewer,
            ConflictReason::RemoteDeleteNewer => ConflictKind::RemoteDeleteNewer,
        };
        let detail = match &conflict.server_todo {
            Some(todo) => format!("server kept '{}'", todo.title),
            None => "server kept the deletion".to_string(),
        };
        Self {
            logged_at,
            server_id: conflict.server_id.clone(),
            kind,
            detail,
        }
    }
}

pub struct ConflictLog {
    path: PathBuf,
}

impl ConflictLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read_all(&self) -> Vec<ConflictEntry> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "conflict log unreadable, starting over");
                Vec::new()
            }
        }
    }

    pub fn append(&self, entries: &[ConflictEntry]) -> Result<(), SyncError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut all = self.read_all();
        all.extend(entries.iter().cloned());

        let encoded = serde_json::to_vec_pretty(&all)
            .map_err(|err| SyncError::CorruptState(format!("could not encode conflict log: {err}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
