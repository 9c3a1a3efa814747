pub mod event;
pub mod handlers;

use crate::accounts::{AccountStorage, Caller};
use crate::pairing::{self, PairingError};
use crate::AppContext;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
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
}

// ─── Error codes ─────────────────────────────────────────────────────────────
//
// unauthenticated        = -32004
// nodeNotFound           = -32020  (pairing::handlers::NODE_NOT_FOUND)
// pairCodeInvalid        = -32021  (pairing::handlers::PAIR_CODE_INVALID)
// provisioningIncomplete = -32023  (pairing::handlers::PROVISIONING_INCOMPLETE)

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const UNAUTHENTICATED: i32 = -32004;

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "IPC server listening (WebSocket + HTTP health on same port)");

    ctx.broadcaster.broadcast(
        "gateway.ready",
        serde_json::json!({
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
                info!("shutdown signal received — stopping IPC server");
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

    info!("IPC server stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The gateway shares one port for both WebSocket (JSON-RPC) and a plain
/// HTTP health endpoint so clients can check liveness without a WS library.
async fn handle_health_check(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request (we don't inspect it — any GET /health is fine).
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
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
    // Peek at the first bytes to distinguish HTTP health checks from WebSocket
    // upgrades — both share the same port. All other GET requests (including
    // WS upgrades) fall through to the WS handshake as normal.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    let mut broadcast_rx = ctx.broadcaster.subscribe();

    // Resolved by `gateway.auth`; until then only unauthenticated methods
    // succeed. The caller is bound per connection, never ambient.
    let mut caller: Option<Caller> = None;

    loop {
        tokio::select! {
            // Incoming message from client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_text(&text, &ctx, &mut caller).await;
                        if let Err(e) = sink.send(Message::Text(response)).await {
                            warn!(err = %e, "send error");
                            break;
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
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
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
    Ok(())
}

pub(crate) async fn handle_text(
    text: &str,
    ctx: &AppContext,
    caller: &mut Option<Caller>,
) -> String {
    // Parse
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            return error_response(Value::Null, PARSE_ERROR, "Parse error");
        }
    };

    // Validate jsonrpc field
    if req.jsonrpc != "2.0" {
        return error_response(
            req.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid Request",
        );
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    debug!(method = %req.method, authenticated = caller.is_some(), "rpc dispatch");

    // `gateway.auth` mutates the connection state, so it is handled here
    // rather than in the dispatch table.
    if req.method == "gateway.auth" {
        return handle_auth(id, params, ctx, caller).await;
    }

    let result = dispatch(&req.method, params, ctx, caller.as_ref()).await;

    match result {
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
            let (code, msg) = classify_error(&e);
            error_response(id, code, &msg)
        }
    }
}

/// Bind this connection to an account by API token.
///
/// Params: `{ "token": "<account api token>" }`.  A revoked or unknown token
/// leaves the connection unauthenticated.
async fn handle_auth(
    id: Value,
    params: Value,
    ctx: &AppContext,
    caller: &mut Option<Caller>,
) -> String {
    let Some(token) = params.get("token").and_then(Value::as_str) else {
        return error_response(id, INVALID_PARAMS, "Invalid params: missing `token`");
    };

    let accounts = AccountStorage::new(ctx.storage.pool());
    match accounts.get_by_token(token).await {
        Ok(Some(account)) => {
            debug!(account = %account.name, "client authenticated");
            let resp = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "authenticated": true,
                    "accountId": &account.id,
                    "accountName": &account.name
                }
            });
            *caller = Some(Caller {
                account_id: account.id,
                account_name: account.name,
            });
            resp.to_string()
        }
        Ok(None) => error_response(id, UNAUTHENTICATED, "Unauthenticated — invalid token"),
        Err(e) => {
            error!(err = %e, "auth lookup failed");
            error_response(id, INTERNAL_ERROR, "Internal error")
        }
    }
}

async fn dispatch(
    method: &str,
    params: Value,
    ctx: &AppContext,
    caller: Option<&Caller>,
) -> anyhow::Result<Value> {
    match method {
        "gateway.ping" => handlers::daemon::ping(params, ctx).await,
        "gateway.status" => handlers::daemon::status(params, ctx).await,
        "pairing.start" => pairing::handlers::start(params, ctx, caller).await,
        "pairing.claim" => pairing::handlers::claim(params, ctx, caller).await,
        "node.list" => pairing::handlers::node_list(params, ctx, caller).await,
        "node.get" => pairing::handlers::node_get(params, ctx, caller).await,
        "node.rename" => pairing::handlers::node_rename(params, ctx, caller).await,
        "node.setStatus" => pairing::handlers::node_set_status(params, ctx, caller).await,
        "capability.list" => pairing::handlers::capability_list(params, ctx, caller).await,
        "capability.upsert" => pairing::handlers::capability_upsert(params, ctx, caller).await,
        "capability.defaults" => pairing::handlers::capability_defaults(params, ctx).await,
        "capability.describe" => pairing::handlers::capability_describe(params, ctx).await,
        _ => Err(anyhow::anyhow!("METHOD_NOT_FOUND:{}", method)),
    }
}

fn classify_error(e: &anyhow::Error) -> (i32, String) {
    // The pairing taxonomy carries its own stable codes.
    if let Some(pe) = e.downcast_ref::<PairingError>() {
        let code = match pe {
            PairingError::Unauthenticated => UNAUTHENTICATED,
            PairingError::InvalidOrExpiredCode => pairing::handlers::PAIR_CODE_INVALID,
            PairingError::PartialProvisioning { .. } => {
                pairing::handlers::PROVISIONING_INCOMPLETE
            }
        };
        return (code, pe.to_string());
    }

    let msg = e.to_string();
    if msg.starts_with("METHOD_NOT_FOUND:") {
        return (METHOD_NOT_FOUND, "Method not found".to_string());
    }
    if msg.contains("NODE_NOT_FOUND") {
        return (pairing::handlers::NODE_NOT_FOUND, "Node not found".to_string());
    }
    if msg.starts_with("Invalid params") {
        return (INVALID_PARAMS, msg);
    }
    if msg.contains("missing field") || msg.contains("invalid type") {
        return (INVALID_PARAMS, format!("Invalid params: {}", msg));
    }
    error!(err = %e, "internal error");
    (INTERNAL_ERROR, "Internal error".to_string())
}

fn error_response(id: Value, code: i32, message: &str) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
        }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}
