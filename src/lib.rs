pub mod board;
pub mod config;
pub mod ipc;
pub mod storage;

// Re-export auth so main.rs can use boardd::auth directly.
pub use ipc::auth;

use std::sync::Arc;

use board::{EditingSessions, PresenceTracker, TaskService};
use config::DaemonConfig;
use ipc::event::EventBroadcaster;
use storage::Storage;

/// Shared application state passed to every RPC handler and connection task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub broadcaster: EventBroadcaster,
    /// Task mutation + action log service. All writes flow through here so
    /// version bumps, action records, and broadcast events stay coupled.
    pub tasks: Arc<TaskService>,
    /// Who is connected right now (in-memory, rebuilt from live connections).
    pub presence: Arc<PresenceTracker>,
    /// Which users hold an editing session on which task (in-memory).
    pub editing: Arc<EditingSessions>,
    pub started_at: std::time::Instant,
    /// Local WebSocket auth token.  Every new connection must send a
    /// `daemon.auth` RPC with this token before any other method call.
    /// Empty string means auth is disabled (not recommended).
    pub auth_token: String,
}

impl AppContext {
    pub fn new(config: DaemonConfig, storage: Storage, auth_token: String) -> Self {
        let storage = Arc::new(storage);
        let broadcaster = EventBroadcaster::new();
        let tasks = Arc::new(TaskService::new(storage.clone(), broadcaster.clone()));
        Self {
            config: Arc::new(config),
            storage,
            broadcaster,
            tasks,
            presence: Arc::new(PresenceTracker::new()),
            editing: Arc::new(EditingSessions::new()),
            started_at: std::time::Instant::now(),
            auth_token,
        }
    }
}
