//! Change detection: diff the current host readout against the snapshot.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::client::host::HostTodo;
use crate::client::snapshot::{DeviceState, LocalTodo};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DetectSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    /// Pending deletions withdrawn because the item reappeared in the host.
    pub withdrawn: usize,
}

impl DetectSummary {
    pub fn any(&self) -> bool {
        self.added + self.modified + self.deleted + self.withdrawn > 0
    }
}

fn local_from_host(item: &HostTodo, position: i64, edited_at: DateTime<Utc>) -> LocalTodo {
    LocalTodo {
        title: item.title.clone(),
        notes: item.notes.clone(),
        due_date: item.due_date,
        tags: item.tags.clone(),
        status: item.status,
        position,
        edited_at,
    }
}

/// Tag comparison is order-insensitive.
fn tag_set(tags: &[String]) -> BTreeSet<&str> {
    tags.iter().map(String::as_str).collect()
}

fn differs(prev: &LocalTodo, item: &HostTodo, position: i64) -> bool {
    prev.title != item.title
        || prev.notes != item.notes
        || prev.due_date != item.due_date
        || tag_set(&prev.tags) != tag_set(&item.tags)
        || prev.status != item.status
        || prev.position != position
}

/// Classify every host item as new, modified or unchanged, record vanished
/// items as pending deletions, and withdraw deletions whose item came back.
/// Touched records get `edited_at = now`; `position` is the item's ordinal
/// in the readout.
pub fn detect(state: &mut DeviceState, readout: &[HostTodo], now: DateTime<Utc>) -> DetectSummary {
    let mut summary = DetectSummary::default();

    for (index, item) in readout.iter().enumerate() {
        let position = index as i64;
        match state.todos.get(&item.id) {
            None => {
                state
                    .todos
                    .insert(item.id.clone(), local_from_host(item, position, now));
                state.dirty.upserted.insert(item.id.clone());
                summary.added += 1;
            }
            Some(prev) if differs(prev, item, position) => {
                state
                    .todos
                    .insert(item.id.clone(), local_from_host(item, position, now));
                state.dirty.upserted.insert(item.id.clone());
                summary.modified += 1;
            }
            Some(_) => {}
        }
    }

    let live: BTreeSet<&str> = readout.iter().map(|item| item.id.as_str()).collect();
    let gone: Vec<String> = state
        .todos
        .keys()
        .filter(|local_id| !live.contains(local_id.as_str()))
        .cloned()
        .collect();
    for local_id in gone {
        state.todos.remove(&local_id);
        state.dirty.upserted.remove(&local_id);
        if let Some(server_id) = state.registry.reverse(&local_id).map(str::to_owned) {
            state.dirty.deleted.entry(server_id).or_insert(now);
        }
        summary.deleted += 1;
    }

    let withdrawn: Vec<String> = state
        .dirty
        .deleted
        .keys()
        .filter(|server_id| {
            state
                .registry
                .get(server_id)
                .is_some_and(|local_id| state.todos.contains_key(local_id))
        })
        .cloned()
        .collect();
    for server_id in withdrawn {
        state.dirty.deleted.remove(&server_id);
        summary.withdrawn += 1;
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 3, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs as i64)
    }

    fn host(id: &str, title: &str) -> HostTodo {
        HostTodo {
            id: id.into(),
            title: title.into(),
            notes: String::new(),
            due_date: None,
            tags: Vec::new(),
            status: Status::Open,
        }
    }

    fn synced_state(entries: &[(&str, &str, &str)]) -> DeviceState {
        // (local id, server id, title), as if a previous cycle persisted them.
        let mut state = DeviceState::fresh();
        for (index, (local_id, server_id, title)) in entries.iter().enumerate() {
            state
                .todos
                .insert(local_id.to_string(), local_from_host(&host(local_id, title), index as i64, at(0)));
            state.registry.bind(server_id, local_id).unwrap();
        }
        state
    }

    #[test]
    fn new_item_is_added_and_stamped() {
        let mut state = DeviceState::fresh();
        let summary = detect(&mut state, &[host("td-1", "new one")], at(30));

        assert_eq!(summary.added, 1);
        assert!(state.dirty.upserted.contains("td-1"));
        let rec = state.todos.get("td-1").unwrap();
        assert_eq!(rec.edited_at, at(30));
        assert_eq!(rec.position, 0);
    }

    #[test]
    fn changed_title_marks_the_record_modified() {
        let mut state = synced_state(&[("td-1", "S1", "before")]);
        let summary = detect(&mut state, &[host("td-1", "after")], at(30));

        assert_eq!(summary.modified, 1);
        assert!(state.dirty.upserted.contains("td-1"));
        assert_eq!(state.todos.get("td-1").unwrap().edited_at, at(30));
    }

    #[test]
    fn tag_order_is_not_a_change() {
        let mut state = synced_state(&[("td-1", "S1", "x")]);
        state.todos.get_mut("td-1").unwrap().tags = vec!["a".into(), "b".into()];

        let mut item = host("td-1", "x");
        item.tags = vec!["b".into(), "a".into()];
        let summary = detect(&mut state, &[item], at(30));

        assert_eq!(summary.modified, 0);
        assert!(state.dirty.upserted.is_empty());
        // Untouched records keep their edit stamp.
        assert_eq!(state.todos.get("td-1").unwrap().edited_at, at(0));
    }

    #[test]
    fn reordering_is_a_change() {
        let mut state = synced_state(&[("td-1", "S1", "one"), ("td-2", "S2", "two")]);
        let summary = detect(&mut state, &[host("td-2", "two"), host("td-1", "one")], at(30));
        assert_eq!(summary.modified, 2);
    }

    #[test]
    fn vanished_mapped_item_becomes_a_pending_delete() {
        let mut state = synced_state(&[("td-1", "S1", "x")]);
        let summary = detect(&mut state, &[], at(30));

        assert_eq!(summary.deleted, 1);
        assert!(!state.todos.contains_key("td-1"));
        assert_eq!(state.dirty.deleted.get("S1"), Some(&at(30)));
        // The mapping survives until the server confirms.
        assert_eq!(state.registry.get("S1"), Some("td-1"));
    }

    #[test]
    fn vanished_unmapped_item_is_dropped_silently() {
        let mut state = DeviceState::fresh();
        detect(&mut state, &[host("td-1", "never pushed")], at(10));
        assert!(state.dirty.upserted.contains("td-1"));

        let summary = detect(&mut state, &[], at(20));
        assert_eq!(summary.deleted, 1);
        assert!(state.dirty.upserted.is_empty());
        assert!(state.dirty.deleted.is_empty());
    }

    #[test]
    fn reappearance_withdraws_the_pending_delete() {
        let mut state = synced_state(&[("td-1", "S1", "x")]);
        detect(&mut state, &[], at(30));
        assert!(state.dirty.deleted.contains_key("S1"));

        let summary = detect(&mut state, &[host("td-1", "x")], at(60));
        assert_eq!(summary.withdrawn, 1);
        assert!(state.dirty.deleted.is_empty());
    }

    #[test]
    fn existing_pending_delete_keeps_its_timestamp() {
        let mut state = synced_state(&[("td-1", "S1", "x")]);
        detect(&mut state, &[], at(30));
        detect(&mut state, &[], at(90));
        assert_eq!(state.dirty.deleted.get("S1"), Some(&at(30)));
    }
}
