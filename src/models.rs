//! Sync data models (shared types between client and server)
//!
//! Wire field names are camelCase; timestamps are RFC 3339 UTC instants and
//! are compared as instants, never as strings.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a todo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Open,
    Completed,
    Canceled,
}

/// A todo as the server knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,
    pub title: String,
    pub notes: String,
    pub due_date: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub status: Status,
    pub position: i64,
    /// Client-supplied timestamp of the mutation that produced this version.
    pub edited_at: DateTime<Utc>,
    /// Server wall clock of the most recent accepted write (delta cursor).
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
}

/// A deletion as it appears in a delta
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedTodo {
    pub server_id: String,
    pub deleted_at: DateTime<Utc>,
}

/// One pending upsert in a push. `server_id` is set when the device already
/// knows the server record; otherwise `client_id` carries the device-local id
/// so the server can return a mapping for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTodo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub title: String,
    pub notes: String,
    pub due_date: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub status: Status,
    pub position: i64,
    pub edited_at: DateTime<Utc>,
}

/// One pending deletion in a push
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushDelete {
    pub server_id: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBatch {
    pub upserted: Vec<PushTodo>,
    pub deleted: Vec<PushDelete>,
}

/// Request body of `POST /push`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub todos: PushBatch,
    pub last_synced_at: DateTime<Utc>,
}

/// Why the server kept its own version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    #[serde(rename = "Remote edit was newer")]
    RemoteEditNewer,
    #[serde(rename = "Remote delete was newer")]
    RemoteDeleteNewer,
}

/// A rejected mutation, returned as data in the push response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub server_id: String,
    pub reason: ConflictReason,
    /// The surviving server version, or null when the record is tombstoned.
    pub server_todo: Option<Todo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_todo: Option<PushTodo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_deleted_at: Option<DateTime<Utc>>,
}

/// Server id assigned to a client-created todo
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub server_id: String,
    pub client_id: String,
}

/// Response of `GET /state` (also embedded in the push response)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub todos: Vec<Todo>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaBatch {
    pub upserted: Vec<Todo>,
    pub deleted: Vec<DeletedTodo>,
}

/// Response of `GET /delta?since=<ts>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    pub todos: DeltaBatch,
    pub synced_at: DateTime<Utc>,
}

/// Response of `POST /push`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub state: StateResponse,
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetCounts {
    pub todos: u64,
}

/// Response of `DELETE /reset`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub success: bool,
    pub deleted: ResetCounts,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn conflict_reason_uses_wire_strings() {
        let json = serde_json::to_string(&ConflictReason::RemoteEditNewer).unwrap();
        assert_eq!(json, "\"Remote edit was newer\"");
        let back: ConflictReason = serde_json::from_str("\"Remote delete was newer\"").unwrap();
        assert_eq!(back, ConflictReason::RemoteDeleteNewer);
    }

    #[test]
    fn empty_tags_round_trip_as_empty_list() {
        let todo = PushTodo {
            server_id: None,
            client_id: Some("td-1".into()),
            title: "buy milk".into(),
            notes: String::new(),
            due_date: None,
            tags: Vec::new(),
            status: Status::Open,
            position: 0,
            edited_at: Utc.with_ymd_and_hms(2026, 1, 3, 12, 0, 0).unwrap(),
        };
        let json = serde_json::to_value(&todo).unwrap();
        assert_eq!(json["tags"], serde_json::json!([]));
        assert_eq!(json["dueDate"], serde_json::Value::Null);
        assert!(json.get("serverId").is_none());

        let back: PushTodo = serde_json::from_value(json).unwrap();
        assert_eq!(back, todo);
    }

    #[test]
    fn push_request_uses_camel_case_fields() {
        let req = PushRequest {
            todos: PushBatch::default(),
            last_synced_at: Utc.with_ymd_and_hms(2026, 1, 3, 12, 0, 0).unwrap(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("lastSyncedAt").is_some());
    }

    #[test]
    fn mappings_default_to_empty_when_absent() {
        let resp: PushResponse = serde_json::from_value(serde_json::json!({
            "state": { "todos": [], "syncedAt": "2026-01-03T12:00:00Z" },
            "conflicts": []
        }))
        .unwrap();
        assert!(resp.mappings.is_empty());
    }
}
