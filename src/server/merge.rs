//! Last-edit-wins decision rule shared by upserts and deletions.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// Outcome of weighing an incoming mutation against the stored write it
/// collides with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The incoming mutation wins and must be applied.
    Accept,
    /// Same instant, same user: a replay of the stored write. Nothing to do,
    /// and no conflict to report.
    Replay,
    /// The stored write wins; report a conflict.
    Reject,
}

/// Compare an incoming `(instant, user)` pair against the stored one.
///
/// Newer instant wins. On equal instants the lexicographically larger user id
/// wins, so two devices seeing the same inputs reach the same answer
/// independently of request order.
pub fn decide(
    incoming_at: DateTime<Utc>,
    incoming_user: &str,
    stored_at: DateTime<Utc>,
    stored_user: &str,
) -> Verdict {
    match incoming_at.cmp(&stored_at) {
        Ordering::Greater => Verdict::Accept,
        Ordering::Less => Verdict::Reject,
        Ordering::Equal => match incoming_user.cmp(stored_user) {
            Ordering::Greater => Verdict::Accept,
            Ordering::Equal => Verdict::Replay,
            Ordering::Less => Verdict::Reject,
        },
    }
}
