//! Pairing and node data model types.

use serde::{Deserialize, Serialize};

/// A one-time pairing code bound to the issuing account.
///
/// The plaintext `pairing_code` is returned in full exactly once, from
/// `pairing.start`. A request is claimable while `node_id` is NULL and
/// `expires_at` lies in the future; `node_id` is set exactly once, on claim,
/// and doubles as the consumption marker. Rows are never deleted — an expired
/// or consumed request is simply dead.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PairingRequest {
    pub id: String,
    /// Owning account; set from the authenticated caller at issuance, immutable.
    pub user_id: String,
    /// 8 characters from the unambiguous 32-symbol alphabet.
    pub pairing_code: String,
    pub created_at: i64,
    /// `created_at + 600` — the claim window is fixed at ten minutes.
    pub expires_at: i64,
    pub node_id: Option<String>,
}

/// A paired node (phone, speaker, browser extension, …) owned by an account.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Node {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// `paired` on creation; `offline` / `error` are set by later flows.
    pub status: String,
    pub connection_health: String,
    /// JSON array of the capability keys granted at creation, in registry order.
    pub capabilities: String,
    pub created_at: i64,
}

/// Outbound view of a [`Node`] with the capability list parsed out of its
/// JSON column.
#[derive(Debug, Clone, Serialize)]
pub struct NodePublic {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: String,
    pub connection_health: String,
    pub capabilities: Vec<String>,
    pub created_at: i64,
}

impl From<Node> for NodePublic {
    fn from(n: Node) -> Self {
        let capabilities = serde_json::from_str(&n.capabilities).unwrap_or_default();
        Self {
            id: n.id,
            user_id: n.user_id,
            name: n.name,
            status: n.status,
            connection_health: n.connection_health,
            capabilities,
            created_at: n.created_at,
        }
    }
}

/// One capability granted to a node.
///
/// Natural key `(node_id, capability_key)` — the upsert that writes these
/// rows is idempotent by that pair.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NodeCapability {
    pub node_id: String,
    pub capability_key: String,
    /// `enabled` | `disabled` | `pending_approval`.
    pub status: String,
    pub description: String,
    /// Free-form JSON object of per-capability settings.
    pub configurations: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Parameters for the `pairing.claim` RPC.
#[derive(Debug, Deserialize)]
pub struct ClaimParams {
    /// The code shown by `pairing.start`. Surrounding whitespace is trimmed;
    /// the comparison itself is exact and case-sensitive.
    pub code: String,
    /// Optional display name; defaults to a suffix of the code.
    #[serde(rename = "nodeName")]
    pub node_name: Option<String>,
}
