//! Presence tracking for connected actors.
//!
//! Process-local only — the map is rebuilt from scratch when the daemon
//! restarts and clients reconnect.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::board::model::now_rfc3339;

/// One entry per connected actor. Keyed by actor id, not connection id:
/// a reconnect (or a second concurrent session) overwrites the entry and
/// rebinds it to the newest connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub conn_id: u64,
    pub username: String,
    pub last_seen: String,
}

#[derive(Default)]
pub struct PresenceTracker {
    inner: Mutex<HashMap<String, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected actor and return the full presence snapshot
    /// for the `activeUsers` broadcast.
    pub fn connect(&self, user_id: &str, conn_id: u64, username: &str) -> Vec<PresenceEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            user_id.to_string(),
            PresenceEntry {
                user_id: user_id.to_string(),
                conn_id,
                username: username.to_string(),
                last_seen: now_rfc3339(),
            },
        );
        snapshot_of(&inner)
    }

    /// Remove a disconnected actor and return the updated snapshot.
    /// Removing an unknown actor is a no-op.
    pub fn disconnect(&self, user_id: &str) -> Vec<PresenceEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(user_id);
        snapshot_of(&inner)
    }

    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        snapshot_of(&self.inner.lock().unwrap())
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

fn snapshot_of(map: &HashMap<String, PresenceEntry>) -> Vec<PresenceEntry> {
    let mut entries: Vec<PresenceEntry> = map.values().cloned().collect();
    entries.sort_by(|a, b| a.username.cmp(&b.username));
    entries
}
