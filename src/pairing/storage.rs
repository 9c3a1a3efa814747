//! SQLite persistence for pairing requests, nodes, and node capabilities.

use anyhow::Result;
use sqlx::SqlitePool;
use ulid::Ulid;
use uuid::Uuid;

use super::code;
use super::model::{Node, NodeCapability, PairingRequest};
use super::registry;

/// Pairing-code time-to-live in seconds (10 minutes).
pub const PAIRING_TTL_SECS: i64 = 600;

fn unixepoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ─── PairingStorage ───────────────────────────────────────────────────────────

pub struct PairingStorage {
    pool: SqlitePool,
}

impl PairingStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ─── Pairing requests ─────────────────────────────────────────────────

    /// Issue a new pairing request for `user_id` and return the full row,
    /// including the plaintext code — the only time it is returned in full.
    ///
    /// Each call is independent: earlier outstanding codes for the same
    /// account stay claimable until they expire or are consumed.
    pub async fn start_pairing(&self, user_id: &str) -> Result<PairingRequest> {
        let id = Uuid::new_v4().to_string();
        let pairing_code = code::generate_code();
        let created_at = unixepoch();
        let expires_at = created_at + PAIRING_TTL_SECS;

        sqlx::query(
            "INSERT INTO pairing_requests \
             (id, user_id, pairing_code, created_at, expires_at, node_id) \
             VALUES (?, ?, ?, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&pairing_code)
        .bind(created_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        self.get_request(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("pairing request not found after insert"))
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<PairingRequest>> {
        Ok(
            sqlx::query_as("SELECT * FROM pairing_requests WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Claim a pairing code for `user_id`: create the node and consume the
    /// request in one transaction.
    ///
    /// Returns `None` when no claimable request matches — wrong code, foreign
    /// account, already consumed, or expired. The four cases are
    /// indistinguishable on purpose.
    ///
    /// Atomicity: the transaction's first statement is the node insert (a
    /// write), so it takes SQLite's write lock up front; the conditional
    /// update that sets `node_id` then re-states the full claim predicate and
    /// its affected-row count is the sole winner/loser discriminator. A loser
    /// rolls back, taking its node insert with it — two concurrent claims of
    /// the same code can never both produce a node.
    pub async fn claim_pairing(
        &self,
        user_id: &str,
        pairing_code: &str,
        node_name: Option<&str>,
    ) -> Result<Option<Node>> {
        let now = unixepoch();

        // Fast path: plainly wrong codes are rejected without paying for an
        // insert + rollback. The transaction below remains the authority.
        let claimable: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM pairing_requests \
             WHERE pairing_code = ? AND user_id = ? AND node_id IS NULL AND expires_at > ? \
             LIMIT 1",
        )
        .bind(pairing_code)
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if claimable.is_none() {
            return Ok(None);
        }

        let node_id = Ulid::new().to_string();
        let name = match node_name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => code::default_node_name(pairing_code),
        };
        let capabilities = serde_json::to_string(&registry::default_keys())?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO nodes \
             (id, user_id, name, status, connection_health, capabilities, created_at) \
             VALUES (?, ?, ?, 'paired', 'healthy', ?, ?)",
        )
        .bind(&node_id)
        .bind(user_id)
        .bind(&name)
        .bind(&capabilities)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let consumed = sqlx::query(
            "UPDATE pairing_requests SET node_id = ? \
             WHERE id = (SELECT id FROM pairing_requests \
                         WHERE pairing_code = ? AND user_id = ? \
                           AND node_id IS NULL AND expires_at > ? \
                         LIMIT 1)",
        )
        .bind(&node_id)
        .bind(pairing_code)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if consumed.rows_affected() == 0 {
            // Lost the race (or the request expired between probe and lock).
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;

        let node = self
            .get_node_unchecked(&node_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("node not found after insert"))?;
        Ok(Some(node))
    }

    // ─── Nodes ────────────────────────────────────────────────────────────

    async fn get_node_unchecked(&self, id: &str) -> Result<Option<Node>> {
        Ok(sqlx::query_as("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Fetch one node, scoped to its owner.
    pub async fn get_node(&self, user_id: &str, id: &str) -> Result<Option<Node>> {
        Ok(
            sqlx::query_as("SELECT * FROM nodes WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// All nodes owned by `user_id`, newest first.
    pub async fn list_nodes(&self, user_id: &str) -> Result<Vec<Node>> {
        Ok(
            sqlx::query_as("SELECT * FROM nodes WHERE user_id = ? ORDER BY created_at DESC, id DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Rename a node. Returns `true` if the owner matched and a row changed.
    pub async fn rename_node(&self, user_id: &str, id: &str, name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET name = ? WHERE id = ? AND user_id = ?")
            .bind(name)
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set a node's lifecycle status (`paired` | `offline` | `error`).
    /// Returns `true` if the owner matched and a row changed.
    pub async fn set_node_status(&self, user_id: &str, id: &str, status: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET status = ? WHERE id = ? AND user_id = ?")
            .bind(status)
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ─── Capabilities ─────────────────────────────────────────────────────

    /// Create or update one capability row, idempotent by
    /// `(node_id, capability_key)`.
    ///
    /// Defaults: `status = enabled`, `description` from the registry,
    /// `configurations = {}`. Calling twice with the same key pair updates
    /// the existing row in place — the latest call wins.
    pub async fn upsert_capability(
        &self,
        node_id: &str,
        capability_key: &str,
        status: Option<&str>,
        description: Option<&str>,
        configurations: Option<&str>,
    ) -> Result<NodeCapability> {
        let status = status.unwrap_or("enabled");
        let description = description.unwrap_or_else(|| registry::describe(capability_key));
        let configurations = configurations.unwrap_or("{}");
        let now = unixepoch();

        sqlx::query(
            "INSERT INTO node_capabilities \
             (node_id, capability_key, status, description, configurations, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(node_id, capability_key) DO UPDATE SET \
               status = excluded.status, \
               description = excluded.description, \
               configurations = excluded.configurations, \
               updated_at = excluded.updated_at",
        )
        .bind(node_id)
        .bind(capability_key)
        .bind(status)
        .bind(description)
        .bind(configurations)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Fetch by the natural key in case the ON CONFLICT branch ran.
        Ok(sqlx::query_as(
            "SELECT * FROM node_capabilities WHERE node_id = ? AND capability_key = ?",
        )
        .bind(node_id)
        .bind(capability_key)
        .fetch_one(&self.pool)
        .await?)
    }

    /// All capability rows of a node, in seeding order.
    pub async fn list_capabilities(&self, node_id: &str) -> Result<Vec<NodeCapability>> {
        Ok(sqlx::query_as(
            "SELECT * FROM node_capabilities WHERE node_id = ? \
             ORDER BY created_at ASC, capability_key ASC",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
