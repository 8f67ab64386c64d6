pub mod auth;
pub mod event;
pub mod handlers;

use crate::board::error::BoardError;
use crate::board::model::Actor;
use crate::AppContext;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    /// Absent for notifications — signals that carry no response.
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
    /// Structured context — for conflicts, the authoritative task.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// ─── Error codes ─────────────────────────────────────────────────────────────

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const UNAUTHORIZED: i32 = -32004;
/// Bad input: empty, duplicate, or reserved title.
const VALIDATION_ERROR: i32 = -32020;
/// Version mismatch — error data carries the current server-side task.
const CONFLICT: i32 = -32021;
const NOT_FOUND: i32 = -32022;
const NO_ELIGIBLE_USER: i32 = -32023;

/// Monotonic connection ids, used to exclude the originator from
/// client-relayed task event fan-out.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "board server listening (WebSocket + HTTP health on same port)");

    ctx.broadcaster.broadcast(
        "daemon.ready",
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "port": ctx.config.port
        }),
    );

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    // Pinned so we can use it in the select! loop without moving.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping board server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("board server stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The daemon shares one port for both WebSocket (JSON-RPC) and a plain
/// HTTP health endpoint so clients can check liveness without a WS library.
async fn handle_health_check(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request (we don't inspect it — any GET /health is fine).
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "activeUsers": ctx.presence.count(),
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek for "GET /health" to distinguish HTTP health checks from
    // WebSocket upgrades; both share the same port. All other GET requests
    // (including WS upgrades) fall through to the handshake as normal.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    // ── Auth handshake ───────────────────────────────────────────────────────
    // The first message from every client must be a `daemon.auth` RPC call
    // carrying the local token plus the authenticated actor identity. The
    // daemon never validates credentials itself — the identity arrives
    // already resolved by the authentication collaborator.
    let actor = match authenticate(&mut sink, &mut stream, &ctx).await? {
        Some(actor) => actor,
        None => return Ok(()),
    };

    // Subscribe before announcing presence: broadcast receivers only see
    // messages sent after subscription, and the connecting client must
    // receive the `activeUsers` snapshot that includes itself.
    let mut broadcast_rx = ctx.broadcaster.subscribe();

    // Register the actor: persist for smart-assign enumeration, then join
    // presence and announce the new snapshot to everyone.
    ctx.storage
        .upsert_user(&actor.id, &actor.username, actor.email.as_deref().unwrap_or(""))
        .await?;
    let users = ctx
        .presence
        .connect(&actor.id, conn_id, &actor.username);
    ctx.broadcaster
        .broadcast("activeUsers", json!({ "users": users }));
    info!(user = %actor.username, conn = conn_id, "client connected");

    loop {
        tokio::select! {
            // Incoming message from client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match handle_text(&text, &actor, conn_id, &ctx).await {
                            Some(response) => {
                                if let Err(e) = sink.send(Message::Text(response)).await {
                                    warn!(err = %e, "send error");
                                    break;
                                }
                            }
                            None => {} // notification — nothing to send back
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            // Outgoing broadcast event
            event = broadcast_rx.recv() => {
                match event {
                    Ok(ev) => {
                        // Client-relayed task events skip their originator.
                        if ev.origin == Some(conn_id) {
                            continue;
                        }
                        if let Err(e) = sink.send(Message::Text(ev.payload)).await {
                            warn!(err = %e, "broadcast send error");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "broadcast lagged");
                    }
                }
            }
        }
    }

    // ── Disconnect cleanup ───────────────────────────────────────────────────
    // Implicit stop-editing for every task the actor held a session on —
    // no conflict signals are re-raised for the editors who remain.
    ctx.editing.remove_actor(&actor.id);
    let users = ctx.presence.disconnect(&actor.id);
    ctx.broadcaster
        .broadcast("activeUsers", json!({ "users": users }));
    info!(user = %actor.username, conn = conn_id, "client disconnected");
    Ok(())
}

/// Run the `daemon.auth` handshake. Returns the authenticated actor, or
/// `None` when the connection should be closed (bad token, timeout,
/// malformed first message).
async fn authenticate<S>(
    sink: &mut futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<S>,
        Message,
    >,
    stream: &mut futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<S>>,
    ctx: &AppContext,
) -> Result<Option<Actor>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let first = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next()).await;

    let text = match first {
        Ok(Some(Ok(Message::Text(t)))) => t,
        // Timeout, connection closed, or non-text frame — reject silently.
        _ => return Ok(None),
    };

    let req: RpcRequest = match serde_json::from_str(&text) {
        Ok(r) => r,
        Err(_) => {
            let _ = sink
                .send(Message::Text(error_response(
                    Value::Null,
                    PARSE_ERROR,
                    "Parse error",
                    None,
                )))
                .await;
            return Ok(None);
        }
    };

    let id = req.id.clone().unwrap_or(Value::Null);

    if req.method != "daemon.auth" {
        let _ = sink
            .send(Message::Text(error_response(
                id,
                UNAUTHORIZED,
                "Unauthorized — send daemon.auth first",
                None,
            )))
            .await;
        return Ok(None);
    }

    let params = req.params.unwrap_or(Value::Null);

    if !ctx.auth_token.is_empty() {
        let provided = params
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if provided != ctx.auth_token {
            let _ = sink
                .send(Message::Text(error_response(
                    id,
                    UNAUTHORIZED,
                    "Unauthorized — invalid token",
                    None,
                )))
                .await;
            return Ok(None);
        }
    }

    let user_id = params.get("userId").and_then(Value::as_str);
    let username = params.get("username").and_then(Value::as_str);
    let (user_id, username) = match (user_id, username) {
        (Some(u), Some(n)) if !u.is_empty() && !n.is_empty() => (u, n),
        _ => {
            let _ = sink
                .send(Message::Text(error_response(
                    id,
                    INVALID_PARAMS,
                    "Invalid params: userId and username are required",
                    None,
                )))
                .await;
            return Ok(None);
        }
    };

    let actor = Actor {
        id: user_id.to_string(),
        username: username.to_string(),
        email: params
            .get("email")
            .and_then(Value::as_str)
            .map(String::from),
    };

    let resp = json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": { "authenticated": true, "userId": actor.id }
    });
    let _ = sink.send(Message::Text(resp.to_string())).await;
    debug!(user = %actor.username, "client authenticated");
    Ok(Some(actor))
}

/// Handle one inbound text frame. Requests (with an id) produce a response
/// string; notifications produce `None` after their side effects run.
async fn handle_text(
    text: &str,
    actor: &Actor,
    conn_id: u64,
    ctx: &AppContext,
) -> Option<String> {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => return Some(error_response(Value::Null, PARSE_ERROR, "Parse error", None)),
    };

    if req.jsonrpc != "2.0" {
        // Notifications never get a response, not even an error one.
        return req
            .id
            .map(|id| error_response(id, INVALID_REQUEST, "Invalid Request", None));
    }

    let params = req.params.unwrap_or(Value::Null);

    match req.id {
        Some(id) => Some(respond(&req.method, params, id, actor, ctx).await),
        None => {
            handle_signal(&req.method, params, actor, conn_id, ctx);
            None
        }
    }
}

/// Best-effort coordination signals and client-relayed task events.
/// Failures here are swallowed — a signal never produces an error response.
fn handle_signal(method: &str, params: Value, actor: &Actor, conn_id: u64, ctx: &AppContext) {
    match method {
        "task.startEditing" => {
            let Some(task_id) = params.get("taskId").and_then(Value::as_str) else {
                return;
            };
            debug!(task = task_id, user = %actor.id, "start editing");
            if let Some(editors) = ctx.editing.start_editing(task_id, &actor.id) {
                ctx.broadcaster.broadcast(
                    "editingConflict",
                    json!({ "taskId": task_id, "editors": editors }),
                );
            }
        }
        "task.stopEditing" => {
            let Some(task_id) = params.get("taskId").and_then(Value::as_str) else {
                return;
            };
            debug!(task = task_id, user = %actor.id, "stop editing");
            ctx.editing.stop_editing(task_id, &actor.id);
        }
        // A client mirrors its own completed local action to everyone else.
        // The originating connection is excluded from the fan-out.
        "task.created" => ctx.broadcaster.broadcast_from(conn_id, "taskCreated", params),
        "task.updated" => ctx.broadcaster.broadcast_from(conn_id, "taskUpdated", params),
        "task.deleted" => ctx.broadcaster.broadcast_from(conn_id, "taskDeleted", params),
        other => debug!(method = other, "unknown notification ignored"),
    }
}

async fn respond(method: &str, params: Value, id: Value, actor: &Actor, ctx: &AppContext) -> String {
    debug!(method = %method, "rpc dispatch");
    match dispatch(method, params, actor, ctx).await {
        Ok(value) => {
            let resp = RpcResponse {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(e) => {
            let (code, msg, data) = classify_error(&e);
            error_response(id, code, &msg, data)
        }
    }
}

async fn dispatch(method: &str, params: Value, actor: &Actor, ctx: &AppContext) -> Result<Value> {
    match method {
        "daemon.ping" => handlers::daemon::ping(params, ctx).await,
        "daemon.status" => handlers::daemon::status(params, ctx).await,
        "task.list" => handlers::tasks::list(params, actor, ctx).await,
        "task.create" => handlers::tasks::create(params, actor, ctx).await,
        "task.update" => handlers::tasks::update(params, actor, ctx).await,
        "task.delete" => handlers::tasks::delete(params, actor, ctx).await,
        "task.smartAssign" => handlers::tasks::smart_assign(params, actor, ctx).await,
        "action.recent" => handlers::actions::recent(params, ctx).await,
        "action.forTask" => handlers::actions::for_task(params, ctx).await,
        "action.forUser" => handlers::actions::for_user(params, ctx).await,
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{}", method)),
    }
}

fn classify_error(e: &anyhow::Error) -> (i32, String, Option<Value>) {
    if let Some(board) = e.downcast_ref::<BoardError>() {
        return match board {
            BoardError::Validation(msg) => (VALIDATION_ERROR, msg.clone(), None),
            BoardError::Conflict { current } => (
                CONFLICT,
                "Conflict detected — task was modified by someone else".to_string(),
                Some(json!({ "currentTask": current })),
            ),
            BoardError::NotFound => (NOT_FOUND, "Task not found".to_string(), None),
            BoardError::NoEligibleUser => (
                NO_ELIGIBLE_USER,
                "No users available for assignment".to_string(),
                None,
            ),
            BoardError::Storage(err) => {
                error!(err = %err, "storage error");
                (INTERNAL_ERROR, "Internal error".to_string(), None)
            }
        };
    }
    let msg = e.to_string();
    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string(), None);
    }
    if msg.contains("missing field") || msg.contains("invalid type") {
        return (INVALID_PARAMS, format!("Invalid params: {}", msg), None);
    }
    error!(err = %e, "internal error");
    (INTERNAL_ERROR, "Internal error".to_string(), None)
}

fn error_response(id: Value, code: i32, message: &str, data: Option<Value>) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
            data,
        }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
