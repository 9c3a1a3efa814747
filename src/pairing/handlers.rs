//! RPC handlers for the pairing and node-management surface.
//!
//! RPC method → handler mapping (registered in `ipc/mod.rs`):
//!
//! | Method                | Handler               | Who calls it                      |
//! |-----------------------|-----------------------|-----------------------------------|
//! | `pairing.start`       | `start`               | Dashboard (shows the code / QR)   |
//! | `pairing.claim`       | `claim`               | Dashboard (user typed the code)   |
//! | `node.list`           | `node_list`           | Dashboard node overview           |
//! | `node.get`            | `node_get`            | Node detail view                  |
//! | `node.rename`         | `node_rename`         | Node detail view                  |
//! | `node.setStatus`      | `node_set_status`     | Connection-health flows           |
//! | `capability.list`     | `capability_list`     | Capability management view        |
//! | `capability.upsert`   | `capability_upsert`   | Capability management view        |
//! | `capability.defaults` | `capability_defaults` | Any display surface (no auth)     |
//! | `capability.describe` | `capability_describe` | Any display surface (no auth)     |

use crate::accounts::Caller;
use crate::AppContext;
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::model::{ClaimParams, NodePublic};
use super::registry;
use super::storage::PairingStorage;
use super::PairingError;

// ─── Error codes ─────────────────────────────────────────────────────────────

/// `node.*` / `capability.*` — no node with the given id owned by the caller.
pub const NODE_NOT_FOUND: i32 = -32020;
/// `pairing.claim` — code invalid, foreign, consumed, or expired (uniform).
pub const PAIR_CODE_INVALID: i32 = -32021;
/// `pairing.claim` — node created but capability seeding did not complete.
pub const PROVISIONING_INCOMPLETE: i32 = -32023;

const NODE_STATUSES: [&str; 3] = ["paired", "offline", "error"];
const CAPABILITY_STATUSES: [&str; 3] = ["enabled", "disabled", "pending_approval"];

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn pairing_storage(ctx: &AppContext) -> PairingStorage {
    PairingStorage::new(ctx.storage.pool())
}

/// Every core operation takes the caller explicitly; a connection that never
/// completed `gateway.auth` has none.
fn require_caller(caller: Option<&Caller>) -> Result<&Caller> {
    caller.ok_or_else(|| PairingError::Unauthenticated.into())
}

// ─── Pairing ─────────────────────────────────────────────────────────────────

/// `pairing.start` — issue a fresh one-time pairing code for the caller.
///
/// The plaintext code appears in this response and nowhere else. The user
/// transmits it out-of-band (shown on screen, scanned from a QR) and the same
/// account submits it back via `pairing.claim` within ten minutes.
pub async fn start(_params: Value, ctx: &AppContext, caller: Option<&Caller>) -> Result<Value> {
    let caller = require_caller(caller)?;
    let request = pairing_storage(ctx)
        .start_pairing(&caller.account_id)
        .await?;

    Ok(json!({
        "id": request.id,
        "pairingCode": request.pairing_code,
        "createdAt": request.created_at,
        "expiresAt": request.expires_at,
    }))
}

/// `pairing.claim` — consume a pairing code and provision the node.
///
/// On success the node exists with `status = paired`, the originating request
/// carries its id, and all five default capabilities are seeded `enabled`
/// with their registry descriptions. Whatever went wrong — unknown code,
/// someone else's code, an already-claimed code, an expired code — the caller
/// sees the same `PAIR_CODE_INVALID` error.
pub async fn claim(params: Value, ctx: &AppContext, caller: Option<&Caller>) -> Result<Value> {
    let caller = require_caller(caller)?;
    let p: ClaimParams = serde_json::from_value(params)?;
    let code = p.code.trim();

    let storage = pairing_storage(ctx);
    let Some(node) = storage
        .claim_pairing(&caller.account_id, code, p.node_name.as_deref())
        .await?
    else {
        return Err(PairingError::InvalidOrExpiredCode.into());
    };

    // Seed the default capability bundle. The upsert is idempotent, so a
    // failed key is retried once; anything still missing fails the call
    // loudly — the node and consumed request remain valid and the rows can
    // be re-driven through `capability.upsert`.
    let mut missing = 0usize;
    for key in registry::default_keys() {
        let seeded = match storage.upsert_capability(&node.id, key, None, None, None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(node_id = %node.id, capability = key, err = %e, "capability seeding failed — retrying");
                storage
                    .upsert_capability(&node.id, key, None, None, None)
                    .await
                    .is_ok()
            }
        };
        if !seeded {
            missing += 1;
        }
    }
    if missing > 0 {
        return Err(PairingError::PartialProvisioning {
            node_id: node.id,
            missing,
        }
        .into());
    }

    // Broadcast public metadata only — the dashboard refreshes its node list.
    let node = NodePublic::from(node);
    ctx.broadcaster.broadcast(
        "node.paired",
        json!({
            "nodeId": &node.id,
            "name": &node.name,
            "userId": &node.user_id,
        }),
    );

    Ok(serde_json::to_value(node)?)
}

// ─── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NodeIdParams {
    #[serde(rename = "nodeId")]
    node_id: String,
}

/// `node.list` — all nodes owned by the caller, newest first.
pub async fn node_list(_params: Value, ctx: &AppContext, caller: Option<&Caller>) -> Result<Value> {
    let caller = require_caller(caller)?;
    let nodes = pairing_storage(ctx).list_nodes(&caller.account_id).await?;
    let nodes: Vec<NodePublic> = nodes.into_iter().map(NodePublic::from).collect();
    Ok(json!({ "nodes": nodes }))
}

/// `node.get` — one node by id (owner-scoped).
pub async fn node_get(params: Value, ctx: &AppContext, caller: Option<&Caller>) -> Result<Value> {
    let caller = require_caller(caller)?;
    let p: NodeIdParams = serde_json::from_value(params)?;
    let node = pairing_storage(ctx)
        .get_node(&caller.account_id, &p.node_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("NODE_NOT_FOUND: no node with id {}", p.node_id))?;
    Ok(serde_json::to_value(NodePublic::from(node))?)
}

/// `node.rename` — update the human-readable label of a node.
///
/// Params: `{ "nodeId": "...", "name": "<new label>" }`
pub async fn node_rename(params: Value, ctx: &AppContext, caller: Option<&Caller>) -> Result<Value> {
    #[derive(Deserialize)]
    struct RenameParams {
        #[serde(rename = "nodeId")]
        node_id: String,
        name: String,
    }

    let caller = require_caller(caller)?;
    let p: RenameParams = serde_json::from_value(params)?;

    let ok = pairing_storage(ctx)
        .rename_node(&caller.account_id, &p.node_id, &p.name)
        .await?;
    if !ok {
        anyhow::bail!("NODE_NOT_FOUND: no node with id {}", p.node_id);
    }

    ctx.broadcaster.broadcast(
        "node.renamed",
        json!({ "nodeId": p.node_id, "name": p.name }),
    );

    Ok(json!({ "ok": true }))
}

/// `node.setStatus` — lifecycle transition hook for non-pairing flows
/// (`paired` | `offline` | `error`).
pub async fn node_set_status(
    params: Value,
    ctx: &AppContext,
    caller: Option<&Caller>,
) -> Result<Value> {
    #[derive(Deserialize)]
    struct SetStatusParams {
        #[serde(rename = "nodeId")]
        node_id: String,
        status: String,
    }

    let caller = require_caller(caller)?;
    let p: SetStatusParams = serde_json::from_value(params)?;
    if !NODE_STATUSES.contains(&p.status.as_str()) {
        anyhow::bail!("Invalid params: unknown node status '{}'", p.status);
    }

    let ok = pairing_storage(ctx)
        .set_node_status(&caller.account_id, &p.node_id, &p.status)
        .await?;
    if !ok {
        anyhow::bail!("NODE_NOT_FOUND: no node with id {}", p.node_id);
    }

    Ok(json!({ "ok": true }))
}

// ─── Capabilities ────────────────────────────────────────────────────────────

/// `capability.list` — capability rows of an owned node, in seeding order.
pub async fn capability_list(
    params: Value,
    ctx: &AppContext,
    caller: Option<&Caller>,
) -> Result<Value> {
    let caller = require_caller(caller)?;
    let p: NodeIdParams = serde_json::from_value(params)?;

    let storage = pairing_storage(ctx);
    if storage
        .get_node(&caller.account_id, &p.node_id)
        .await?
        .is_none()
    {
        anyhow::bail!("NODE_NOT_FOUND: no node with id {}", p.node_id);
    }

    let capabilities = storage.list_capabilities(&p.node_id).await?;
    Ok(json!({ "capabilities": capabilities }))
}

/// `capability.upsert` — create or update one capability of an owned node.
///
/// Omitted fields fall back to their defaults (`enabled`, the registry
/// description, `{}`). Idempotent by `(nodeId, capabilityKey)`.
pub async fn capability_upsert(
    params: Value,
    ctx: &AppContext,
    caller: Option<&Caller>,
) -> Result<Value> {
    #[derive(Deserialize)]
    struct UpsertParams {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "capabilityKey")]
        capability_key: String,
        status: Option<String>,
        description: Option<String>,
        configurations: Option<Value>,
    }

    let caller = require_caller(caller)?;
    let p: UpsertParams = serde_json::from_value(params)?;
    if let Some(status) = &p.status {
        if !CAPABILITY_STATUSES.contains(&status.as_str()) {
            anyhow::bail!("Invalid params: unknown capability status '{status}'");
        }
    }

    let storage = pairing_storage(ctx);
    if storage
        .get_node(&caller.account_id, &p.node_id)
        .await?
        .is_none()
    {
        anyhow::bail!("NODE_NOT_FOUND: no node with id {}", p.node_id);
    }

    let configurations = p.configurations.map(|v| v.to_string());
    let capability = storage
        .upsert_capability(
            &p.node_id,
            &p.capability_key,
            p.status.as_deref(),
            p.description.as_deref(),
            configurations.as_deref(),
        )
        .await?;

    Ok(serde_json::to_value(capability)?)
}

/// `capability.defaults` — the registry: default keys and descriptions, in
/// the fixed order they are granted at pairing time. Pure lookup, no auth.
pub async fn capability_defaults(_params: Value, _ctx: &AppContext) -> Result<Value> {
    let capabilities: Vec<Value> = registry::DEFAULT_CAPABILITIES
        .iter()
        .map(|(key, description)| json!({ "key": key, "description": description }))
        .collect();
    Ok(json!({ "capabilities": capabilities }))
}

/// `capability.describe` — one description; unknown keys echo back unchanged.
pub async fn capability_describe(params: Value, _ctx: &AppContext) -> Result<Value> {
    #[derive(Deserialize)]
    struct DescribeParams {
        key: String,
    }

    let p: DescribeParams = serde_json::from_value(params)?;
    Ok(json!({ "key": p.key, "description": registry::describe(&p.key) }))
}
