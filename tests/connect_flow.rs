//! WebSocket connect-flow tests against a live server.
//!
//! These start `ipc::run` on an ephemeral port and drive it with a real
//! tokio-tungstenite client, covering the auth handshake and the presence
//! announcements around it.

use boardd::config::DaemonConfig;
use boardd::storage::Storage;
use boardd::{ipc, AppContext};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type ClientWs = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Start a daemon on an OS-assigned free port and return the port.
async fn start_server(data_dir: &std::path::Path) -> u16 {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let config = DaemonConfig {
        port,
        data_dir: data_dir.to_path_buf(),
        log: "error".to_string(),
        bind_address: "127.0.0.1".to_string(),
        log_format: "pretty".to_string(),
    };
    let storage = Storage::in_memory().await.unwrap();
    // Empty token: auth handshake still required, token check skipped.
    let ctx = Arc::new(AppContext::new(config, storage, String::new()));
    tokio::spawn(async move {
        let _ = ipc::run(ctx).await;
    });
    port
}

async fn connect(port: u16) -> ClientWs {
    let url = format!("ws://127.0.0.1:{port}");
    for _ in 0..50 {
        if let Ok((ws, _)) = connect_async(&url).await {
            return ws;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server on port {port} never became reachable");
}

async fn recv_json(ws: &mut ClientWs) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("ws error");
    match frame {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn authenticate(ws: &mut ClientWs, user_id: &str, username: &str) {
    let auth = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "daemon.auth",
        "params": { "token": "", "userId": user_id, "username": username }
    });
    ws.send(Message::Text(auth.to_string())).await.unwrap();
    let resp = recv_json(ws).await;
    assert_eq!(resp["result"]["authenticated"], true);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

/// A connecting client must receive the presence snapshot that announces
/// itself — the subscription is live before the snapshot is broadcast.
#[tokio::test]
async fn connecting_client_receives_its_own_presence_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(dir.path()).await;

    let mut ws = connect(port).await;
    authenticate(&mut ws, "u1", "alice").await;

    let ev = recv_json(&mut ws).await;
    assert_eq!(ev["method"], "activeUsers");
    let users = ev["params"]["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["userId"], "u1");
    assert_eq!(users[0]["username"], "alice");
}

/// Presence fan-out on join and leave reaches the clients that stay.
#[tokio::test]
async fn presence_updates_reach_existing_clients() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(dir.path()).await;

    let mut alice = connect(port).await;
    authenticate(&mut alice, "u1", "alice").await;
    // Alice's own snapshot.
    assert_eq!(recv_json(&mut alice).await["method"], "activeUsers");

    let mut bob = connect(port).await;
    authenticate(&mut bob, "u2", "bob").await;

    // Alice sees bob join.
    let ev = recv_json(&mut alice).await;
    assert_eq!(ev["method"], "activeUsers");
    let users = ev["params"]["users"].as_array().unwrap();
    assert_eq!(users.len(), 2);

    // Bob leaves; alice sees the shrunken snapshot.
    bob.close(None).await.unwrap();
    let ev = recv_json(&mut alice).await;
    assert_eq!(ev["method"], "activeUsers");
    let users = ev["params"]["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["userId"], "u1");
}
