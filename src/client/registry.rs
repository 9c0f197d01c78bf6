//! Bijective mapping between server ids and device-local ids.
//!
//! Mapping loss is the canonical cause of duplicated items, so a bind that
//! would break the bijection aborts the sync instead of corrupting the
//! device.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("duplicate mapping: server id {server_id} / local id {local_id} already bound elsewhere")]
pub struct DuplicateMapping {
    pub server_id: String,
    pub local_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdRegistry {
    server_to_local: BTreeMap<String, String>,
    local_to_server: BTreeMap<String, String>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted server→local map, rejecting any map that is
    /// not a bijection.
    pub fn from_map(map: BTreeMap<String, String>) -> Result<Self, DuplicateMapping> {
        let mut registry = Self::new();
        for (server_id, local_id) in map {
            registry.bind(&server_id, &local_id)?;
        }
        Ok(registry)
    }

    /// The persisted representation: server id → local id.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.server_to_local
    }

    pub fn get(&self, server_id: &str) -> Option<&str> {
        self.server_to_local.get(server_id).map(String::as_str)
    }

    pub fn reverse(&self, local_id: &str) -> Option<&str> {
        self.local_to_server.get(local_id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.server_to_local.is_empty()
    }

    pub fn len(&self) -> usize {
        self.server_to_local.len()
    }

    /// Bind a pair. Re-binding the exact same pair is fine; anything that
    /// would point two ids at one counterpart is not.
    pub fn bind(&mut self, server_id: &str, local_id: &str) -> Result<(), DuplicateMapping> {
        let held_local = self.server_to_local.get(server_id);
        let held_server = self.local_to_server.get(local_id);
        match (held_local, held_server) {
            (Some(l), Some(s)) if l == local_id && s == server_id => return Ok(()),
            (None, None) => {}
            _ => {
                return Err(DuplicateMapping {
                    server_id: server_id.to_string(),
                    local_id: local_id.to_string(),
                });
            }
        }
        self.server_to_local
            .insert(server_id.to_string(), local_id.to_string());
        self.local_to_server
            .insert(local_id.to_string(), server_id.to_string());
        Ok(())
    }

    /// Drop a mapping after a confirmed remote deletion. Returns the local id
    /// the server id pointed to, if any.
    pub fn unbind(&mut self, server_id: &str) -> Option<String> {
        let local_id = self.server_to_local.remove(server_id)?;
        self.local_to_server.remove(&local_id);
        Some(local_id)
    }
}
