//! taskdeck-sync - self-hosted sync for the Taskdeck task manager.
//!
//! Two halves share this crate: the sync service (`server`), which owns the
//! authoritative todo store and merges concurrent edits, and the device
//! engine (`client`), which mirrors a local Taskdeck app against it one
//! sync cycle at a time.

pub mod client;
pub mod config;
pub mod models;
pub mod server;
