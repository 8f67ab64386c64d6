use serde_json::Value;
use tokio::sync::broadcast;

/// A JSON-RPC notification destined for connected WebSocket clients.
///
/// `origin` is the connection id of the client whose own action produced
/// the event, if any. Connection loops skip messages whose origin matches
/// their own id — the originator already has the result locally.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub origin: Option<u64>,
    pub payload: String,
}

/// Fans out mutation events and presence/conflict signals to all connected
/// WebSocket clients as JSON-RPC notifications.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<OutboundEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Send a notification to every connected client, including whichever
    /// connection triggered it. Used for server-originated mutation events
    /// and for presence/conflict signals.
    pub fn broadcast(&self, method: &str, params: Value) {
        self.send(None, method, params);
    }

    /// Send a notification to every connected client except `origin`.
    /// Used for client-relayed task events mirroring the originator's own
    /// local action.
    pub fn broadcast_from(&self, origin: u64, method: &str, params: Value) {
        self.send(Some(origin), method, params);
    }

    fn send(&self, origin: Option<u64>, method: &str, params: Value) {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        // Ignore errors — no subscribers is fine
        let _ = self.tx.send(OutboundEvent {
            origin,
            payload: serde_json::to_string(&notification).unwrap_or_default(),
        });
    }

    /// Subscribe to all broadcast events.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }
}
