//! Integration tests for the hubd JSON-RPC server.
//! Spins up a real gateway on a free port and drives the pairing flow
//! end-to-end over WebSocket.

use futures_util::{SinkExt, StreamExt};
use hubd::{
    accounts::{Account, AccountStorage},
    config::GatewayConfig,
    ipc::event::EventBroadcaster,
    pairing::registry,
    pairing::storage::PairingStorage,
    storage::Storage,
    AppContext,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Start a gateway on a random port and return the WebSocket URL.
async fn start_test_gateway() -> (String, Arc<AppContext>) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let port = get_free_port();

    let config = Arc::new(GatewayConfig::new(
        Some(port),
        Some(data_dir.clone()),
        Some("warn".to_string()),
        None,
    ));
    let storage = Arc::new(Storage::new(&data_dir).await.unwrap());
    let broadcaster = Arc::new(EventBroadcaster::new());

    let ctx = Arc::new(AppContext {
        config,
        storage,
        broadcaster,
        started_at: std::time::Instant::now(),
        gateway_id: "test-gateway-id".to_string(),
    });

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        hubd::ipc::run(ctx_server).await.ok();
    });

    // Give server a moment to bind
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{}", ctx.config.port);
    (url, ctx)
}

fn get_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn create_account(ctx: &AppContext, name: &str) -> Account {
    AccountStorage::new(ctx.storage.pool())
        .create_account(name)
        .await
        .unwrap()
}

/// A persistent WebSocket client — auth binds to the connection, so every
/// test drives one connection rather than one socket per call.
struct WsClient {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    next_id: i64,
}

impl WsClient {
    async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("ws connect failed");
        Self { ws, next_id: 1 }
    }

    async fn rpc(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        self.ws
            .send(Message::Text(serde_json::to_string(&request).unwrap()))
            .await
            .unwrap();

        // Read messages until we get the response (skip notifications)
        loop {
            let msg = self.ws.next().await.unwrap().unwrap();
            if let Message::Text(text) = msg {
                let v: Value = serde_json::from_str(&text).unwrap();
                if v.get("id").is_some() {
                    return v;
                }
            }
        }
    }

    async fn auth(&mut self, token: &str) {
        let resp = self.rpc("gateway.auth", json!({ "token": token })).await;
        assert_eq!(resp["result"]["authenticated"], true, "auth failed: {resp}");
    }
}

#[tokio::test]
async fn test_gateway_ping() {
    let (url, _ctx) = start_test_gateway().await;
    let mut client = WsClient::connect(&url).await;
    let resp = client.rpc("gateway.ping", json!({})).await;
    assert_eq!(resp["result"]["pong"], true);
}

#[tokio::test]
async fn test_method_not_found() {
    let (url, _ctx) = start_test_gateway().await;
    let mut client = WsClient::connect(&url).await;
    let resp = client.rpc("no.such.method", json!({})).await;
    assert_eq!(resp["error"]["code"], -32601);
}

#[tokio::test]
async fn test_core_methods_require_auth() {
    let (url, _ctx) = start_test_gateway().await;
    let mut client = WsClient::connect(&url).await;

    for method in ["pairing.start", "pairing.claim", "node.list"] {
        let resp = client.rpc(method, json!({ "code": "ABCDEFGH" })).await;
        assert_eq!(
            resp["error"]["code"], -32004,
            "{method} must require authentication"
        );
    }
}

#[tokio::test]
async fn test_auth_rejects_unknown_and_revoked_tokens() {
    let (url, ctx) = start_test_gateway().await;
    let mut client = WsClient::connect(&url).await;

    let resp = client.rpc("gateway.auth", json!({ "token": "bogus" })).await;
    assert_eq!(resp["error"]["code"], -32004);

    let account = create_account(&ctx, "revoked-user").await;
    AccountStorage::new(ctx.storage.pool())
        .revoke_account(&account.id)
        .await
        .unwrap();
    let resp = client
        .rpc("gateway.auth", json!({ "token": account.api_token }))
        .await;
    assert_eq!(resp["error"]["code"], -32004);
}

#[tokio::test]
async fn test_full_pairing_flow() {
    let (url, ctx) = start_test_gateway().await;
    let account = create_account(&ctx, "alice").await;

    let mut client = WsClient::connect(&url).await;
    client.auth(&account.api_token).await;

    // Issue a code.
    let resp = client.rpc("pairing.start", json!({})).await;
    let result = &resp["result"];
    let code = result["pairingCode"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 8);
    assert_eq!(
        result["expiresAt"].as_i64().unwrap() - result["createdAt"].as_i64().unwrap(),
        600
    );

    // Claim it — surrounding whitespace is trimmed before comparison.
    let resp = client
        .rpc("pairing.claim", json!({ "code": format!("  {code}\n") }))
        .await;
    let node = &resp["result"];
    assert_eq!(node["status"], "paired");
    assert_eq!(node["connection_health"], "healthy");
    let expected_name = format!("Node {}", &code[2..]);
    assert_eq!(node["name"], expected_name.as_str());
    let granted: Vec<String> = node["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(granted, registry::default_keys());

    // All five capability rows exist, enabled, with the registry text.
    let node_id = node["id"].as_str().unwrap().to_string();
    let resp = client
        .rpc("capability.list", json!({ "nodeId": node_id }))
        .await;
    let caps = resp["result"]["capabilities"].as_array().unwrap();
    assert_eq!(caps.len(), 5);
    for cap in caps {
        let key = cap["capability_key"].as_str().unwrap();
        assert_eq!(cap["status"], "enabled");
        assert_eq!(cap["description"], registry::describe(key));
    }

    // The originating request now points at the node.
    let row: (Option<String>,) =
        sqlx::query_as("SELECT node_id FROM pairing_requests WHERE pairing_code = ?")
            .bind(&code)
            .fetch_one(&ctx.storage.pool())
            .await
            .unwrap();
    assert_eq!(row.0.as_deref(), Some(node_id.as_str()));

    // The node shows up in the owner's list.
    let resp = client.rpc("node.list", json!({})).await;
    assert_eq!(resp["result"]["nodes"].as_array().unwrap().len(), 1);

    // A second claim of the same code is uniformly rejected.
    let resp = client.rpc("pairing.claim", json!({ "code": code })).await;
    assert_eq!(resp["error"]["code"], -32021);
}

#[tokio::test]
async fn test_claim_is_case_sensitive() {
    let (url, ctx) = start_test_gateway().await;
    let account = create_account(&ctx, "alice").await;
    let mut client = WsClient::connect(&url).await;
    client.auth(&account.api_token).await;

    let resp = client.rpc("pairing.start", json!({})).await;
    let code = resp["result"]["pairingCode"].as_str().unwrap().to_string();

    let resp = client
        .rpc("pairing.claim", json!({ "code": code.to_lowercase() }))
        .await;
    assert_eq!(resp["error"]["code"], -32021);

    // No node was created by the failed attempt.
    let resp = client.rpc("node.list", json!({})).await;
    assert!(resp["result"]["nodes"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_is_scoped_to_the_issuing_account() {
    let (url, ctx) = start_test_gateway().await;
    let alice = create_account(&ctx, "alice").await;
    let mallory = create_account(&ctx, "mallory").await;

    let mut alice_ws = WsClient::connect(&url).await;
    alice_ws.auth(&alice.api_token).await;
    let resp = alice_ws.rpc("pairing.start", json!({})).await;
    let code = resp["result"]["pairingCode"].as_str().unwrap().to_string();

    let mut mallory_ws = WsClient::connect(&url).await;
    mallory_ws.auth(&mallory.api_token).await;
    let resp = mallory_ws.rpc("pairing.claim", json!({ "code": &code })).await;
    assert_eq!(resp["error"]["code"], -32021);

    // Alice can still claim her own code afterwards.
    let resp = alice_ws.rpc("pairing.claim", json!({ "code": &code })).await;
    assert!(resp["error"].is_null(), "owner claim failed: {resp}");
}

#[tokio::test]
async fn test_claim_rejects_expired_codes() {
    let (url, ctx) = start_test_gateway().await;
    let account = create_account(&ctx, "alice").await;
    let mut client = WsClient::connect(&url).await;
    client.auth(&account.api_token).await;

    // Plant a request whose window has already closed.
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    sqlx::query(
        "INSERT INTO pairing_requests \
         (id, user_id, pairing_code, created_at, expires_at, node_id) \
         VALUES ('req-exp', ?, 'ABCDEFGH', ?, ?, NULL)",
    )
    .bind(&account.id)
    .bind(now - 700)
    .bind(now - 100)
    .execute(&ctx.storage.pool())
    .await
    .unwrap();

    let resp = client
        .rpc("pairing.claim", json!({ "code": "ABCDEFGH" }))
        .await;
    assert_eq!(resp["error"]["code"], -32021);
}

#[tokio::test]
async fn test_claim_with_custom_node_name() {
    let (url, ctx) = start_test_gateway().await;
    let account = create_account(&ctx, "alice").await;
    let mut client = WsClient::connect(&url).await;
    client.auth(&account.api_token).await;

    let resp = client.rpc("pairing.start", json!({})).await;
    let code = resp["result"]["pairingCode"].as_str().unwrap().to_string();

    let resp = client
        .rpc(
            "pairing.claim",
            json!({ "code": code, "nodeName": "Living Room Display" }),
        )
        .await;
    assert_eq!(resp["result"]["name"], "Living Room Display");
}

#[tokio::test]
async fn test_capability_upsert_is_idempotent_over_rpc() {
    let (url, ctx) = start_test_gateway().await;
    let account = create_account(&ctx, "alice").await;
    let mut client = WsClient::connect(&url).await;
    client.auth(&account.api_token).await;

    let resp = client.rpc("pairing.start", json!({})).await;
    let code = resp["result"]["pairingCode"].as_str().unwrap().to_string();
    let resp = client.rpc("pairing.claim", json!({ "code": code })).await;
    let node_id = resp["result"]["id"].as_str().unwrap().to_string();

    let resp = client
        .rpc(
            "capability.upsert",
            json!({
                "nodeId": node_id,
                "capabilityKey": "remote_exec",
                "status": "pending_approval",
                "description": "Run commands (awaiting approval)"
            }),
        )
        .await;
    assert_eq!(resp["result"]["status"], "pending_approval");

    // Still exactly five rows; the remote_exec row reflects the latest call.
    let resp = client
        .rpc("capability.list", json!({ "nodeId": node_id }))
        .await;
    let caps = resp["result"]["capabilities"].as_array().unwrap();
    assert_eq!(caps.len(), 5);
    let remote_exec = caps
        .iter()
        .find(|c| c["capability_key"] == "remote_exec")
        .unwrap();
    assert_eq!(remote_exec["status"], "pending_approval");
    assert_eq!(remote_exec["description"], "Run commands (awaiting approval)");
}

#[tokio::test]
async fn test_capability_upsert_rejects_foreign_nodes() {
    let (url, ctx) = start_test_gateway().await;
    let alice = create_account(&ctx, "alice").await;
    let mallory = create_account(&ctx, "mallory").await;

    let mut alice_ws = WsClient::connect(&url).await;
    alice_ws.auth(&alice.api_token).await;
    let resp = alice_ws.rpc("pairing.start", json!({})).await;
    let code = resp["result"]["pairingCode"].as_str().unwrap().to_string();
    let resp = alice_ws.rpc("pairing.claim", json!({ "code": code })).await;
    let node_id = resp["result"]["id"].as_str().unwrap().to_string();

    let mut mallory_ws = WsClient::connect(&url).await;
    mallory_ws.auth(&mallory.api_token).await;
    let resp = mallory_ws
        .rpc(
            "capability.upsert",
            json!({ "nodeId": node_id, "capabilityKey": "remote_exec" }),
        )
        .await;
    assert_eq!(resp["error"]["code"], -32020);
}

#[tokio::test]
async fn test_node_rename_and_set_status() {
    let (url, ctx) = start_test_gateway().await;
    let account = create_account(&ctx, "alice").await;
    let mut client = WsClient::connect(&url).await;
    client.auth(&account.api_token).await;

    let resp = client.rpc("pairing.start", json!({})).await;
    let code = resp["result"]["pairingCode"].as_str().unwrap().to_string();
    let resp = client.rpc("pairing.claim", json!({ "code": code })).await;
    let node_id = resp["result"]["id"].as_str().unwrap().to_string();

    let resp = client
        .rpc("node.rename", json!({ "nodeId": node_id, "name": "Hallway" }))
        .await;
    assert_eq!(resp["result"]["ok"], true);

    let resp = client
        .rpc(
            "node.setStatus",
            json!({ "nodeId": node_id, "status": "offline" }),
        )
        .await;
    assert_eq!(resp["result"]["ok"], true);

    let resp = client.rpc("node.get", json!({ "nodeId": node_id })).await;
    assert_eq!(resp["result"]["name"], "Hallway");
    assert_eq!(resp["result"]["status"], "offline");

    // Unknown lifecycle states are rejected before touching the store.
    let resp = client
        .rpc(
            "node.setStatus",
            json!({ "nodeId": node_id, "status": "exploded" }),
        )
        .await;
    assert_eq!(resp["error"]["code"], -32602);

    let resp = client
        .rpc("node.rename", json!({ "nodeId": "no-such-node", "name": "x" }))
        .await;
    assert_eq!(resp["error"]["code"], -32020);
}

#[tokio::test]
async fn test_registry_lookups_need_no_auth() {
    let (url, _ctx) = start_test_gateway().await;
    let mut client = WsClient::connect(&url).await;

    let resp = client.rpc("capability.defaults", json!({})).await;
    let caps = resp["result"]["capabilities"].as_array().unwrap();
    assert_eq!(caps.len(), 5);
    assert_eq!(caps[0]["key"], "voice_wake");

    let resp = client
        .rpc("capability.describe", json!({ "key": "unknown_key" }))
        .await;
    assert_eq!(resp["result"]["description"], "unknown_key");
}

/// Two concurrent claims of the same code: exactly one wins, exactly one
/// node exists afterwards. Uses a file-backed database so both tasks really
/// share state across pool connections.
#[tokio::test]
async fn test_concurrent_double_claim() {
    let data_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(data_dir.path()).await.unwrap();
    let pool = storage.pool();

    let issuer = PairingStorage::new(pool.clone());
    let request = issuer.start_pairing("u1").await.unwrap();
    let code = request.pairing_code.clone();

    let (code_a, code_b) = (code.clone(), code.clone());
    let (pool_a, pool_b) = (pool.clone(), pool.clone());
    let a = tokio::spawn(async move {
        PairingStorage::new(pool_a)
            .claim_pairing("u1", &code_a, None)
            .await
            .unwrap()
    });
    let b = tokio::spawn(async move {
        PairingStorage::new(pool_b)
            .claim_pairing("u1", &code_b, None)
            .await
            .unwrap()
    });

    let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
    let successes = [&ra, &rb].iter().filter(|r| r.is_some()).count();
    assert_eq!(successes, 1, "exactly one claim must win");

    let nodes = issuer.list_nodes("u1").await.unwrap();
    assert_eq!(nodes.len(), 1, "the loser must not leave a node behind");

    // The consumed request points at the winner's node.
    let winner = ra.or(rb).unwrap();
    let consumed = issuer.get_request(&request.id).await.unwrap().unwrap();
    assert_eq!(consumed.node_id.as_deref(), Some(winner.id.as_str()));
}
