//! User accounts and API-token authentication.
//!
//! Every core operation takes the calling account as an explicit parameter —
//! there is no ambient "current user". The WebSocket layer resolves a
//! [`Caller`] once per connection via `gateway.auth` and passes it down.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

/// The resolved identity of an authenticated caller.
///
/// Handlers receive `Option<&Caller>`; `None` means the connection never
/// completed `gateway.auth`.
#[derive(Debug, Clone)]
pub struct Caller {
    pub account_id: String,
    pub account_name: String,
}

/// An account that may authenticate against the gateway and own paired nodes.
///
/// The `api_token` field is a 32-char hex string (UUID v4, dashes stripped).
/// It is shown exactly once, when the account is created from the CLI.
///
/// **Never send this struct to a client over the wire.** Use [`AccountPublic`]
/// for all outbound JSON — it omits the secret token.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// 32-char hex token — only visible server-side and at creation time.
    pub api_token: String,
    pub created_at: String,
    pub last_seen_at: Option<String>,
    /// `0` = active, `1` = revoked (SQLite INTEGER).
    pub revoked: i64,
}

impl Account {
    /// Returns `true` if this account has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked != 0
    }
}

/// Public view of an account — safe to send to any connected client.
#[derive(Debug, Clone, Serialize)]
pub struct AccountPublic {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub last_seen_at: Option<String>,
    pub revoked: bool,
}

impl From<Account> for AccountPublic {
    fn from(a: Account) -> Self {
        let revoked = a.is_revoked();
        Self {
            id: a.id,
            name: a.name,
            created_at: a.created_at,
            last_seen_at: a.last_seen_at,
            revoked,
        }
    }
}

/// Generate a 32-char hex API token (UUID v4, dashes stripped).
fn random_api_token() -> String {
    Uuid::new_v4().simple().to_string()
}

// ─── AccountStorage ───────────────────────────────────────────────────────────

pub struct AccountStorage {
    pool: SqlitePool,
}

impl AccountStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new account and return it, including the secret API token.
    ///
    /// The caller is responsible for showing the token exactly once.
    pub async fn create_account(&self, name: &str) -> Result<Account> {
        let id = Uuid::new_v4().to_string();
        let api_token = random_api_token();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO accounts (id, name, api_token, created_at, revoked) \
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(&id)
        .bind(name)
        .bind(&api_token)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_account(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("account not found after insert"))
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        Ok(sqlx::query_as("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// List all accounts, newest first (public view — no tokens).
    pub async fn list_accounts(&self) -> Result<Vec<AccountPublic>> {
        let rows = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AccountPublic::from).collect())
    }

    /// Look up an account by its API token.  Updates `last_seen_at` on a hit.
    ///
    /// Used by the connection auth handshake to validate `gateway.auth` tokens.
    /// Returns `None` if the token is unknown or the account is revoked.
    pub async fn get_by_token(&self, token: &str) -> Result<Option<Account>> {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM accounts WHERE api_token = ? AND revoked = 0")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        let Some((id,)) = exists else {
            return Ok(None);
        };

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE accounts SET last_seen_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&id)
            .execute(&self.pool)
            .await?;

        self.get_account(&id).await
    }

    /// Revoke an account so its token no longer authenticates.
    ///
    /// Returns `true` if the row was found and updated, `false` if the account
    /// id does not exist or was already revoked.
    pub async fn revoke_account(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET revoked = 1 WHERE id = ? AND revoked = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        // In-memory SQLite gives each pool connection its own database —
        // pin the pool to a single connection so every query sees the schema.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                api_token    TEXT NOT NULL UNIQUE,
                created_at   TEXT NOT NULL,
                last_seen_at TEXT,
                revoked      INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        pool
    }

    #[tokio::test]
    async fn test_create_account() {
        let storage = AccountStorage::new(test_pool().await);
        let account = storage.create_account("alice").await.unwrap();

        assert_eq!(account.name, "alice");
        assert_eq!(account.api_token.len(), 32, "token must be 32 hex chars");
        assert!(
            account.api_token.chars().all(|c| c.is_ascii_hexdigit()),
            "token must be lowercase hex"
        );
        assert!(!account.is_revoked());
    }

    #[tokio::test]
    async fn test_get_by_token_updates_last_seen() {
        let storage = AccountStorage::new(test_pool().await);
        let account = storage.create_account("bob").await.unwrap();
        assert!(account.last_seen_at.is_none());

        let found = storage
            .get_by_token(&account.api_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, account.id);
        assert!(
            found.last_seen_at.is_some(),
            "get_by_token must update last_seen_at"
        );
    }

    #[tokio::test]
    async fn test_revoked_account_cannot_authenticate() {
        let storage = AccountStorage::new(test_pool().await);
        let account = storage.create_account("carol").await.unwrap();

        assert!(storage.revoke_account(&account.id).await.unwrap());
        // Revoking again is a no-op.
        assert!(!storage.revoke_account(&account.id).await.unwrap());

        let found = storage.get_by_token(&account.api_token).await.unwrap();
        assert!(found.is_none(), "revoked token must not authenticate");
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let storage = AccountStorage::new(test_pool().await);
        let found = storage.get_by_token("not-a-token").await.unwrap();
        assert!(found.is_none());
    }
}
