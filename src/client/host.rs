//! The host task application seam.
//!
//! The sync core only depends on the capability set `{list, create, update}`.
//! Creates cannot set a status and nothing can delete; both are limitations
//! of the Taskdeck integration surface. Creates may also be eventually
//! consistent: a created item can take a moment to show up in a readout.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Status;

#[derive(Debug, Error)]
#[error("host app unavailable: {0}")]
pub struct HostError(pub String);

/// One todo as the host app reports it. Ordering in the readout is
/// meaningful; the sync core derives `position` from it.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTodo {
    pub id: String,
    pub title: String,
    pub notes: String,
    pub due_date: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub status: Status,
}

/// Fields for a host-app create or update. `status` is honored only by
/// updates; the integration cannot set it at creation time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostFields {
    pub title: String,
    pub notes: String,
    pub due_date: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub status: Option<Status>,
}

pub trait HostApp {
    fn list_todos(&self, project: &str) -> Result<Vec<HostTodo>, HostError>;
    fn create_todo(&mut self, project: &str, fields: &HostFields) -> Result<(), HostError>;
    fn update_todo(&mut self, project: &str, id: &str, fields: &HostFields)
    -> Result<(), HostError>;
}

// --- built-in file adapter ---

#[derive(Debug, Default, Serialize, Deserialize)]
struct HostFile {
    #[serde(default)]
    projects: BTreeMap<String, Vec<HostRecord>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostRecord {
    id: String,
    title: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    due_date: Option<NaiveDate>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    status: Status,
}

/// Taskdeck adapter backed by the app's JSON board file. Good enough to run
/// a full cycle against a local install; swapped out for the real bridge in
/// packaged builds.
pub struct JsonFileHost {
    path: PathBuf,
}

impl JsonFileHost {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<HostFile, HostError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|err| HostError(format!("{}: {err}", self.path.display()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HostFile::default()),
            Err(err) => Err(HostError(format!("{}: {err}", self.path.display()))),
        }
    }

    fn write(&self, file: &HostFile) -> Result<(), HostError> {
        let encoded = serde_json::to_vec_pretty(file)
            .map_err(|err| HostError(format!("encode: {err}")))?;
        fs::write(&self.path, encoded)
            .map_err(|err| HostError(format!("{}: {err}", self.path.display())))
    }
}

impl HostApp for JsonFileHost {
    fn list_todos(&self, project: &str) -> Result<Vec<HostTodo>, HostError> {
        let file = self.read()?;
        Ok(file
            .projects
            .get(project)
            .map(|records| {
                records
                    .iter()
                    .map(|r| HostTodo {
                        id: r.id.clone(),
                        title: r.title.clone(),
                        notes: r.notes.clone(),
                        due_date: r.due_date,
                        tags: r.tags.clone(),
                        status: r.status,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn create_todo(&mut self, project: &str, fields: &HostFields) -> Result<(), HostError> {
        let mut file = self.read()?;
        file.projects
            .entry(project.to_string())
            .or_default()
            .push(HostRecord {
                id: format!("td-{}", Uuid::new_v4()),
                title: fields.title.clone(),
                notes: fields.notes.clone(),
                due_date: fields.due_date,
                tags: fields.tags.clone(),
                // New Taskdeck items always start open.
                status: Status::Open,
            });
        self.write(&file)
    }

    fn update_todo(
        &mut self,
        project: &str,
        id: &str,
        fields: &HostFields,
    ) -> Result<(), HostError> {
        let mut file = self.read()?;
        let records = file
            .projects
            .get_mut(project)
            .ok_or_else(|| HostError(format!("unknown project '{project}'")))?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| HostError(format!("no todo '{id}' in project '{project}'")))?;

        record.title = fields.title.clone();
        record.notes = fields.notes.clone();
        record.due_date = fields.due_date;
        record.tags = fields.tags.clone();
        if let Some(status) = fields.status {
            record.status = status;
        }
        self.write(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_appends_and_keeps_readout_order() {
        let dir = TempDir::new().unwrap();
        let mut host = JsonFileHost::new(dir.path().join("board.json"));

        host.create_todo("inbox", &HostFields { title: "first".into(), ..Default::default() })
            .unwrap();
        host.create_todo("inbox", &HostFields { title: "second".into(), ..Default::default() })
            .unwrap();

        let todos = host.list_todos("inbox").unwrap();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[0].title, "first");
        assert_eq!(todos[1].title, "second");
        assert!(host.list_todos("other").unwrap().is_empty());
    }

    #[test]
    fn create_cannot_set_status_but_update_can() {
        let dir = TempDir::new().unwrap();
        let mut host = JsonFileHost::new(dir.path().join("board.json"));

        host.create_todo(
            "inbox",
            &HostFields {
                title: "done already".into(),
                status: Some(Status::Completed),
                ..Default::default()
            },
        )
        .unwrap();
        let todos = host.list_todos("inbox").unwrap();
        assert_eq!(todos[0].status, Status::Open);

        host.update_todo(
            "inbox",
            &todos[0].id,
            &HostFields {
                title: "done already".into(),
                status: Some(Status::Completed),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(host.list_todos("inbox").unwrap()[0].status, Status::Completed);
    }

    #[test]
    fn updating_a_missing_todo_fails() {
        let dir = TempDir::new().unwrap();
        let mut host = JsonFileHost::new(dir.path().join("board.json"));
        let err = host.update_todo("inbox", "td-nope", &HostFields::default());
        assert!(err.is_err());
    }
}
