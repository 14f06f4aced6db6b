//! PostgreSQL storage backend for the token vault (§6.3).
//!
//! A single `auth_vault` table holds every vault entry; lookups are
//! indexed by `(user_id, token_type)`, `session_state_id`, `token_hash`,
//! and `ack_state` per §4.2. Raw `query`/`query_scalar` calls are used
//! throughout rather than the compile-time-checked `sqlx::query!` macros,
//! since there is no live database available when this crate is built.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::pool::Pool;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_core::row::Row;
use sqlx_postgres::{PgRow, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use auth_vault::crypto::{self, VaultKey};
use auth_vault::error::{VaultError, VaultResult};
use auth_vault::storage::{
    CreateEntry, CreatePendingEntry, UpdateOfflineToken, UpsertRefreshToken, VaultStorage,
    merge_metadata,
};
use auth_vault::types::{EntryStatus, TokenType, VaultEntry};

pub type PgPool = Pool<Postgres>;

/// The DDL this backend expects; applied by whatever migration tooling
/// wraps this crate (not run here — no live database at build time).
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS auth_vault (
    id               UUID PRIMARY KEY,
    user_id          TEXT NOT NULL,
    token_type       TEXT NOT NULL CHECK (token_type IN ('refresh', 'offline')),
    encrypted_token  TEXT,
    iv               TEXT,
    token_hash       TEXT,
    session_state_id TEXT,
    created_at       TIMESTAMPTZ NOT NULL,
    expires_at       TIMESTAMPTZ NOT NULL,
    status           TEXT NOT NULL CHECK (status IN ('pending', 'active', 'failed', 'none')),
    task_id          TEXT,
    ack_state        TEXT,
    metadata         JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE INDEX IF NOT EXISTS auth_vault_user_type_idx ON auth_vault (user_id, token_type);
CREATE INDEX IF NOT EXISTS auth_vault_session_idx ON auth_vault (session_state_id);
CREATE INDEX IF NOT EXISTS auth_vault_token_hash_idx ON auth_vault (token_hash);
CREATE UNIQUE INDEX IF NOT EXISTS auth_vault_ack_state_idx ON auth_vault (ack_state) WHERE ack_state IS NOT NULL;
CREATE INDEX IF NOT EXISTS auth_vault_expires_at_idx ON auth_vault (expires_at);
"#;

/// Narrower storage error for this backend; converted into
/// `VaultError::Storage` at the trait boundary.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx_core::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn err(operation: &str, e: impl Into<StorageError>) -> VaultError {
    VaultError::storage(operation, e.into().to_string())
}

/// PostgreSQL implementation of `VaultStorage`.
#[derive(Clone)]
pub struct PostgresVaultStorage {
    pool: Arc<PgPool>,
    key: VaultKey,
}

impl PostgresVaultStorage {
    #[must_use]
    pub fn new(pool: Arc<PgPool>, key: VaultKey) -> Self {
        Self { pool, key }
    }

    /// Connects to `database_url` with the crate's default pool sizing.
    pub async fn connect(database_url: &str, key: VaultKey) -> Result<Self, StorageError> {
        use sqlx_core::pool::PoolOptions;
        let pool = PoolOptions::<Postgres>::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(Arc::new(pool), key))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn encrypt_token(&self, token: &str) -> VaultResult<(String, String, String)> {
        let iv = crypto::generate_iv();
        let ciphertext = crypto::encrypt(&self.key, &iv, token)?;
        let hash = crypto::hash(token);
        Ok((ciphertext, hex::encode(iv), hash))
    }
}

fn token_type_str(t: TokenType) -> &'static str {
    match t {
        TokenType::Refresh => "refresh",
        TokenType::Offline => "offline",
    }
}

fn parse_token_type(s: &str) -> TokenType {
    match s {
        "offline" => TokenType::Offline,
        _ => TokenType::Refresh,
    }
}

fn status_str(s: EntryStatus) -> &'static str {
    match s {
        EntryStatus::Pending => "pending",
        EntryStatus::Active => "active",
        EntryStatus::Failed => "failed",
        EntryStatus::None => "none",
    }
}

fn parse_status(s: &str) -> EntryStatus {
    match s {
        "pending" => EntryStatus::Pending,
        "active" => EntryStatus::Active,
        "failed" => EntryStatus::Failed,
        _ => EntryStatus::None,
    }
}

fn row_to_entry(row: PgRow) -> Result<VaultEntry, StorageError> {
    let metadata_value: serde_json::Value = row.try_get("metadata")?;
    let metadata = match metadata_value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Default::default(),
    };
    Ok(VaultEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token_type: parse_token_type(row.try_get::<String, _>("token_type")?.as_str()),
        encrypted_token: row.try_get("encrypted_token")?,
        iv: row.try_get("iv")?,
        token_hash: row.try_get("token_hash")?,
        session_state_id: row.try_get("session_state_id")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str()),
        task_id: row.try_get("task_id")?,
        ack_state: row.try_get("ack_state")?,
        metadata,
    })
}

#[async_trait]
impl VaultStorage for PostgresVaultStorage {
    async fn create(&self, input: CreateEntry) -> VaultResult<VaultEntry> {
        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let expires_at = input.expires_at;
        let (ciphertext, iv, hash) = self.encrypt_token(&input.token)?;
        let metadata = serde_json::to_value(&input.metadata).map_err(|e| err("create", e))?;

        query(
            r#"
            INSERT INTO auth_vault
                (id, user_id, token_type, encrypted_token, iv, token_hash,
                 session_state_id, created_at, expires_at, status, task_id, ack_state, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'active', NULL, NULL, $10)
            "#,
        )
        .bind(id)
        .bind(&input.user_id)
        .bind(token_type_str(input.token_type))
        .bind(&ciphertext)
        .bind(&iv)
        .bind(&hash)
        .bind(&input.session_state_id)
        .bind(now)
        .bind(expires_at)
        .bind(&metadata)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| err("create", e))?;

        Ok(VaultEntry {
            id,
            user_id: input.user_id,
            token_type: input.token_type,
            encrypted_token: Some(ciphertext),
            iv: Some(iv),
            token_hash: Some(hash),
            session_state_id: input.session_state_id,
            created_at: now,
            expires_at,
            status: EntryStatus::Active,
            task_id: None,
            ack_state: None,
            metadata: input.metadata,
        })
    }

    async fn create_pending(&self, input: CreatePendingEntry) -> VaultResult<VaultEntry> {
        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let metadata = serde_json::to_value(&input.metadata).map_err(|e| err("create_pending", e))?;

        query(
            r#"
            INSERT INTO auth_vault
                (id, user_id, token_type, encrypted_token, iv, token_hash,
                 session_state_id, created_at, expires_at, status, task_id, ack_state, metadata)
            VALUES ($1, $2, 'offline', NULL, NULL, NULL, $3, $4, $5, 'pending', $6, NULL, $7)
            "#,
        )
        .bind(id)
        .bind(&input.user_id)
        .bind(&input.session_state_id)
        .bind(now)
        .bind(input.expires_at)
        .bind(&input.task_id)
        .bind(&metadata)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| err("create_pending", e))?;

        Ok(VaultEntry {
            id,
            user_id: input.user_id,
            token_type: TokenType::Offline,
            encrypted_token: None,
            iv: None,
            token_hash: None,
            session_state_id: input.session_state_id,
            created_at: now,
            expires_at: input.expires_at,
            status: EntryStatus::Pending,
            task_id: input.task_id,
            ack_state: None,
            metadata: input.metadata,
        })
    }

    async fn retrieve(&self, id: Uuid) -> VaultResult<Option<VaultEntry>> {
        let row = query("SELECT * FROM auth_vault WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| err("retrieve", e))?;

        let Some(row) = row else { return Ok(None) };
        let entry = row_to_entry(row).map_err(|e| err("retrieve", e))?;

        if entry.is_expired() {
            // Best-effort lazy GC per I5; a failure here is not fatal to the read.
            let _ = query("DELETE FROM auth_vault WHERE id = $1")
                .bind(id)
                .execute(self.pool.as_ref())
                .await;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn delete(&self, id: Uuid) -> VaultResult<()> {
        query("DELETE FROM auth_vault WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| err("delete", e))?;
        Ok(())
    }

    async fn get_user_refresh_token_by_id(&self, id: Uuid) -> VaultResult<Option<VaultEntry>> {
        let row = query("SELECT * FROM auth_vault WHERE id = $1 AND token_type = 'refresh'")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| err("get_user_refresh_token_by_id", e))?;
        row.map(row_to_entry)
            .transpose()
            .map_err(|e| err("get_user_refresh_token_by_id", e))
    }

    async fn get_user_refresh_token_by_user_id(
        &self,
        user_id: &str,
    ) -> VaultResult<Option<VaultEntry>> {
        let row = query(
            "SELECT * FROM auth_vault WHERE user_id = $1 AND token_type = 'refresh' ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| err("get_user_refresh_token_by_user_id", e))?;
        row.map(row_to_entry)
            .transpose()
            .map_err(|e| err("get_user_refresh_token_by_user_id", e))
    }

    async fn get_user_refresh_token_by_session_id(
        &self,
        session_state_id: &str,
    ) -> VaultResult<Option<VaultEntry>> {
        let row = query(
            "SELECT * FROM auth_vault WHERE session_state_id = $1 AND token_type = 'refresh' LIMIT 1",
        )
        .bind(session_state_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| err("get_user_refresh_token_by_session_id", e))?;
        row.map(row_to_entry)
            .transpose()
            .map_err(|e| err("get_user_refresh_token_by_session_id", e))
    }

    async fn update_offline_token_by_id(&self, input: UpdateOfflineToken) -> VaultResult<()> {
        let row = query("SELECT * FROM auth_vault WHERE id = $1")
            .bind(input.id)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| err("update_offline_token_by_id", e))?;
        let Some(row) = row else { return Ok(()) };
        let mut entry = row_to_entry(row).map_err(|e| err("update_offline_token_by_id", e))?;

        let (ciphertext, iv, hash) = match &input.token {
            Some(token) => {
                let (c, i, h) = self.encrypt_token(token)?;
                (Some(c), Some(i), Some(h))
            }
            None => (entry.encrypted_token.clone(), entry.iv.clone(), entry.token_hash.clone()),
        };

        let session_state_id = input.session_state_id.or(entry.session_state_id.clone());
        let expires_at = input.expires_at.unwrap_or(entry.expires_at);

        merge_metadata(
            &mut entry.metadata,
            std::collections::HashMap::from([(
                "tokenActivatedAt".to_string(),
                serde_json::Value::String(OffsetDateTime::now_utc().to_string()),
            )]),
        );
        let metadata = serde_json::to_value(&entry.metadata).map_err(|e| err("update_offline_token_by_id", e))?;

        query(
            r#"
            UPDATE auth_vault
            SET encrypted_token = $2, iv = $3, token_hash = $4, status = $5,
                session_state_id = $6, expires_at = $7, metadata = $8
            WHERE id = $1
            "#,
        )
        .bind(input.id)
        .bind(&ciphertext)
        .bind(&iv)
        .bind(&hash)
        .bind(status_str(input.status))
        .bind(&session_state_id)
        .bind(expires_at)
        .bind(&metadata)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| err("update_offline_token_by_id", e))?;

        Ok(())
    }

    async fn upsert_refresh_token(&self, input: UpsertRefreshToken) -> VaultResult<Uuid> {
        let existing = query(
            "SELECT id, metadata FROM auth_vault WHERE session_state_id = $1 AND token_type = 'refresh' LIMIT 1",
        )
        .bind(&input.session_state_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| err("upsert_refresh_token", e))?;

        let (ciphertext, iv, hash) = self.encrypt_token(&input.token)?;

        if let Some(row) = existing {
            let id: Uuid = row.try_get("id").map_err(|e| err("upsert_refresh_token", e))?;
            let existing_metadata: serde_json::Value =
                row.try_get("metadata").map_err(|e| err("upsert_refresh_token", e))?;
            let mut metadata: std::collections::HashMap<String, serde_json::Value> = match existing_metadata {
                serde_json::Value::Object(map) => map.into_iter().collect(),
                _ => Default::default(),
            };
            merge_metadata(&mut metadata, input.metadata);
            let metadata = serde_json::to_value(&metadata).map_err(|e| err("upsert_refresh_token", e))?;

            query(
                r#"
                UPDATE auth_vault
                SET encrypted_token = $2, iv = $3, token_hash = $4, expires_at = $5, metadata = $6
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&ciphertext)
            .bind(&iv)
            .bind(&hash)
            .bind(input.expires_at)
            .bind(&metadata)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| err("upsert_refresh_token", e))?;
            Ok(id)
        } else {
            let id = Uuid::new_v4();
            let now = OffsetDateTime::now_utc();
            let metadata = serde_json::to_value(&input.metadata).map_err(|e| err("upsert_refresh_token", e))?;
            query(
                r#"
                INSERT INTO auth_vault
                    (id, user_id, token_type, encrypted_token, iv, token_hash,
                     session_state_id, created_at, expires_at, status, task_id, ack_state, metadata)
                VALUES ($1, $2, 'refresh', $3, $4, $5, $6, $7, $8, 'active', NULL, NULL, $9)
                "#,
            )
            .bind(id)
            .bind(&input.user_id)
            .bind(&ciphertext)
            .bind(&iv)
            .bind(&hash)
            .bind(&input.session_state_id)
            .bind(now)
            .bind(input.expires_at)
            .bind(&metadata)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| err("upsert_refresh_token", e))?;
            Ok(id)
        }
    }

    async fn retrieve_user_persistent_id_by_session(
        &self,
        session_state_id: &str,
    ) -> VaultResult<Option<Uuid>> {
        let id: Option<Uuid> = query_scalar(
            "SELECT id FROM auth_vault WHERE session_state_id = $1 AND token_type = 'offline' ORDER BY created_at DESC LIMIT 1",
        )
        .bind(session_state_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| err("retrieve_user_persistent_id_by_session", e))?;
        Ok(id)
    }

    async fn retrieve_all_by_session_state_id(
        &self,
        session_state_id: &str,
        exclude_id: Option<Uuid>,
        token_type: Option<TokenType>,
    ) -> VaultResult<Vec<VaultEntry>> {
        let rows = query(
            r#"
            SELECT * FROM auth_vault
            WHERE session_state_id = $1
              AND ($2::uuid IS NULL OR id != $2)
              AND ($3::text IS NULL OR token_type = $3)
            ORDER BY created_at DESC
            "#,
        )
        .bind(session_state_id)
        .bind(exclude_id)
        .bind(token_type.map(token_type_str))
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| err("retrieve_all_by_session_state_id", e))?;

        rows.into_iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, StorageError>>()
            .map_err(|e| err("retrieve_all_by_session_state_id", e))
    }

    async fn retrieve_duplicate_token_hash(&self, hash: &str, exclude_id: Uuid) -> VaultResult<bool> {
        let exists: bool = query_scalar(
            "SELECT EXISTS(SELECT 1 FROM auth_vault WHERE token_hash = $1 AND id != $2)",
        )
        .bind(hash)
        .bind(exclude_id)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|e| err("retrieve_duplicate_token_hash", e))?;
        Ok(exists)
    }

    async fn get_by_ack_state(&self, ack_state: &str) -> VaultResult<Option<VaultEntry>> {
        let row = query("SELECT * FROM auth_vault WHERE ack_state = $1")
            .bind(ack_state)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(|e| err("get_by_ack_state", e))?;
        row.map(row_to_entry).transpose().map_err(|e| err("get_by_ack_state", e))
    }

    async fn update_ack_state(&self, id: Uuid, ack_state: &str) -> VaultResult<()> {
        query("UPDATE auth_vault SET ack_state = $2 WHERE id = $1")
            .bind(id)
            .bind(ack_state)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| err("update_ack_state", e))?;
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> VaultResult<Vec<VaultEntry>> {
        let rows = query("SELECT * FROM auth_vault WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(|e| err("list_by_user", e))?;
        rows.into_iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, StorageError>>()
            .map_err(|e| err("list_by_user", e))
    }

    async fn cleanup_expired(&self) -> VaultResult<u64> {
        let result = query("DELETE FROM auth_vault WHERE expires_at < NOW()")
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| err("cleanup_expired", e))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_type_round_trips_through_strings() {
        assert_eq!(parse_token_type(token_type_str(TokenType::Refresh)), TokenType::Refresh);
        assert_eq!(parse_token_type(token_type_str(TokenType::Offline)), TokenType::Offline);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [EntryStatus::Pending, EntryStatus::Active, EntryStatus::Failed, EntryStatus::None] {
            assert_eq!(parse_status(status_str(status)), status);
        }
    }
}
