//! Redis storage backend for the token vault (§4.2 key-value mapping).
//!
//! Primary blob at `token:{id}`; secondary indexes `user:{userId}:tokens`
//! (set), `user:{userId}:refresh` (single id), `ackState:{ackState}` (id).
//! TTL is native: every write sets `EXPIRE` from `expiresAt - now`, clamped
//! to at least one second, so `cleanup_expired` is a no-op here. Session
//! and hash-dedup lookups have no secondary index in this mapping and fall
//! back to an O(n) `SCAN` over `token:*`, as the key-value mapping
//! explicitly accepts.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use time::OffsetDateTime;
use uuid::Uuid;

use auth_vault::crypto::{self, VaultKey};
use auth_vault::error::{VaultError, VaultResult};
use auth_vault::storage::{
    CreateEntry, CreatePendingEntry, UpdateOfflineToken, UpsertRefreshToken, VaultStorage,
    merge_metadata,
};
use auth_vault::types::{TokenType, VaultEntry};

fn token_key(id: Uuid) -> String {
    format!("token:{id}")
}

fn user_tokens_key(user_id: &str) -> String {
    format!("user:{user_id}:tokens")
}

fn user_refresh_key(user_id: &str) -> String {
    format!("user:{user_id}:refresh")
}

fn ack_state_key(ack_state: &str) -> String {
    format!("ackState:{ack_state}")
}

/// Seconds until `expires_at`, clamped to at least one second per §4.2.
fn ttl_secs(expires_at: OffsetDateTime) -> u64 {
    (expires_at - OffsetDateTime::now_utc())
        .whole_seconds()
        .max(1) as u64
}

fn to_vault_error(operation: &str, e: impl std::fmt::Display) -> VaultError {
    VaultError::storage(operation, e.to_string())
}

/// Redis implementation of `VaultStorage`.
#[derive(Clone)]
pub struct RedisVaultStorage {
    pool: Pool,
    key: VaultKey,
}

impl RedisVaultStorage {
    #[must_use]
    pub fn new(pool: Pool, key: VaultKey) -> Self {
        Self { pool, key }
    }

    fn encrypt_token(&self, token: &str) -> VaultResult<(String, String, String)> {
        let iv = crypto::generate_iv();
        let ciphertext = crypto::encrypt(&self.key, &iv, token)?;
        let hash = crypto::hash(token);
        Ok((ciphertext, hex::encode(iv), hash))
    }

    async fn conn(&self, operation: &str) -> VaultResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| to_vault_error(operation, e))
    }

    async fn get_entry(
        &self,
        conn: &mut deadpool_redis::Connection,
        id: Uuid,
        operation: &str,
    ) -> VaultResult<Option<VaultEntry>> {
        let raw: Option<String> = conn
            .get(token_key(id))
            .await
            .map_err(|e| to_vault_error(operation, e))?;
        match raw {
            None => Ok(None),
            Some(json) => {
                let entry: VaultEntry =
                    serde_json::from_str(&json).map_err(|e| to_vault_error(operation, e))?;
                if entry.is_expired() {
                    self.purge(conn, &entry).await?;
                    return Ok(None);
                }
                Ok(Some(entry))
            }
        }
    }

    async fn put_entry(
        &self,
        conn: &mut deadpool_redis::Connection,
        entry: &VaultEntry,
        operation: &str,
    ) -> VaultResult<()> {
        let json = serde_json::to_string(entry).map_err(|e| to_vault_error(operation, e))?;
        let ttl = ttl_secs(entry.expires_at);
        let _: () = conn
            .set_ex(token_key(entry.id), json, ttl)
            .await
            .map_err(|e| to_vault_error(operation, e))?;
        Ok(())
    }

    /// Removes every index pointer referencing `entry`, used both on
    /// explicit delete and on lazy expiry eviction.
    async fn purge(&self, conn: &mut deadpool_redis::Connection, entry: &VaultEntry) -> VaultResult<()> {
        let _: () = conn.del(token_key(entry.id)).await.map_err(|e| to_vault_error("purge", e))?;
        let _: () = conn
            .srem(user_tokens_key(&entry.user_id), entry.id.to_string())
            .await
            .map_err(|e| to_vault_error("purge", e))?;
        if entry.token_type == TokenType::Refresh {
            let current: Option<String> = conn
                .get(user_refresh_key(&entry.user_id))
                .await
                .map_err(|e| to_vault_error("purge", e))?;
            if current.as_deref() == Some(entry.id.to_string().as_str()) {
                let _: () = conn
                    .del(user_refresh_key(&entry.user_id))
                    .await
                    .map_err(|e| to_vault_error("purge", e))?;
            }
        }
        if let Some(ack_state) = &entry.ack_state {
            let _: () = conn.del(ack_state_key(ack_state)).await.map_err(|e| to_vault_error("purge", e))?;
        }
        Ok(())
    }

    /// O(n) scan over every live entry. Used only by operations the §4.2
    /// key-value mapping explicitly exempts from an index requirement.
    async fn scan_all(&self, operation: &str) -> VaultResult<Vec<VaultEntry>> {
        let mut conn = self.conn(operation).await?;
        let mut keys: Vec<String> = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>("token:*")
            .await
            .map_err(|e| to_vault_error(operation, e))?;
        use futures_util::StreamExt;
        while let Some(key) = iter.next().await {
            keys.push(key);
        }
        drop(iter);

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await.map_err(|e| to_vault_error(operation, e))?;
            if let Some(json) = raw {
                if let Ok(entry) = serde_json::from_str::<VaultEntry>(&json) {
                    if !entry.is_expired() {
                        entries.push(entry);
                    }
                }
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl VaultStorage for RedisVaultStorage {
    async fn create(&self, input: CreateEntry) -> VaultResult<VaultEntry> {
        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let (ciphertext, iv, hash) = self.encrypt_token(&input.token)?;
        let entry = VaultEntry {
            id,
            user_id: input.user_id.clone(),
            token_type: input.token_type,
            encrypted_token: Some(ciphertext),
            iv: Some(iv),
            token_hash: Some(hash),
            session_state_id: input.session_state_id,
            created_at: now,
            expires_at: input.expires_at,
            status: auth_vault::types::EntryStatus::Active,
            task_id: None,
            ack_state: None,
            metadata: input.metadata,
        };

        let mut conn = self.conn("create").await?;
        self.put_entry(&mut conn, &entry, "create").await?;
        let _: () = conn
            .sadd(user_tokens_key(&input.user_id), id.to_string())
            .await
            .map_err(|e| to_vault_error("create", e))?;
        if entry.token_type == TokenType::Refresh {
            let _: () = conn
                .set(user_refresh_key(&input.user_id), id.to_string())
                .await
                .map_err(|e| to_vault_error("create", e))?;
        }
        Ok(entry)
    }

    async fn create_pending(&self, input: CreatePendingEntry) -> VaultResult<VaultEntry> {
        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let entry = VaultEntry {
            id,
            user_id: input.user_id.clone(),
            token_type: TokenType::Offline,
            encrypted_token: None,
            iv: None,
            token_hash: None,
            session_state_id: input.session_state_id,
            created_at: now,
            expires_at: input.expires_at,
            status: auth_vault::types::EntryStatus::Pending,
            task_id: input.task_id,
            ack_state: None,
            metadata: input.metadata,
        };

        let mut conn = self.conn("create_pending").await?;
        self.put_entry(&mut conn, &entry, "create_pending").await?;
        let _: () = conn
            .sadd(user_tokens_key(&input.user_id), id.to_string())
            .await
            .map_err(|e| to_vault_error("create_pending", e))?;
        Ok(entry)
    }

    async fn retrieve(&self, id: Uuid) -> VaultResult<Option<VaultEntry>> {
        let mut conn = self.conn("retrieve").await?;
        self.get_entry(&mut conn, id, "retrieve").await
    }

    async fn delete(&self, id: Uuid) -> VaultResult<()> {
        let mut conn = self.conn("delete").await?;
        if let Some(entry) = self.get_entry(&mut conn, id, "delete").await? {
            self.purge(&mut conn, &entry).await?;
        }
        Ok(())
    }

    async fn get_user_refresh_token_by_id(&self, id: Uuid) -> VaultResult<Option<VaultEntry>> {
        let mut conn = self.conn("get_user_refresh_token_by_id").await?;
        let entry = self.get_entry(&mut conn, id, "get_user_refresh_token_by_id").await?;
        Ok(entry.filter(|e| e.token_type == TokenType::Refresh))
    }

    async fn get_user_refresh_token_by_user_id(
        &self,
        user_id: &str,
    ) -> VaultResult<Option<VaultEntry>> {
        let mut conn = self.conn("get_user_refresh_token_by_user_id").await?;
        let id_str: Option<String> = conn
            .get(user_refresh_key(user_id))
            .await
            .map_err(|e| to_vault_error("get_user_refresh_token_by_user_id", e))?;
        let Some(id_str) = id_str else { return Ok(None) };
        let Ok(id) = id_str.parse::<Uuid>() else { return Ok(None) };
        self.get_entry(&mut conn, id, "get_user_refresh_token_by_user_id").await
    }

    async fn get_user_refresh_token_by_session_id(
        &self,
        session_state_id: &str,
    ) -> VaultResult<Option<VaultEntry>> {
        let entries = self.scan_all("get_user_refresh_token_by_session_id").await?;
        Ok(entries
            .into_iter()
            .find(|e| e.token_type == TokenType::Refresh && e.session_state_id.as_deref() == Some(session_state_id)))
    }

    async fn update_offline_token_by_id(&self, input: UpdateOfflineToken) -> VaultResult<()> {
        let mut conn = self.conn("update_offline_token_by_id").await?;
        let Some(mut entry) = self.get_entry(&mut conn, input.id, "update_offline_token_by_id").await? else {
            return Ok(());
        };

        if let Some(token) = &input.token {
            let (ciphertext, iv, hash) = self.encrypt_token(token)?;
            entry.encrypted_token = Some(ciphertext);
            entry.iv = Some(iv);
            entry.token_hash = Some(hash);
        }
        entry.status = input.status;
        if input.session_state_id.is_some() {
            entry.session_state_id = input.session_state_id;
        }
        if let Some(expires_at) = input.expires_at {
            entry.expires_at = expires_at;
        }
        merge_metadata(
            &mut entry.metadata,
            std::collections::HashMap::from([(
                "tokenActivatedAt".to_string(),
                serde_json::Value::String(OffsetDateTime::now_utc().to_string()),
            )]),
        );

        self.put_entry(&mut conn, &entry, "update_offline_token_by_id").await
    }

    async fn upsert_refresh_token(&self, input: UpsertRefreshToken) -> VaultResult<Uuid> {
        let mut conn = self.conn("upsert_refresh_token").await?;
        let existing = self
            .get_user_refresh_token_by_user_id(&input.user_id)
            .await?
            .filter(|e| e.session_state_id.as_deref() == Some(input.session_state_id.as_str()));

        let (ciphertext, iv, hash) = self.encrypt_token(&input.token)?;

        if let Some(mut entry) = existing {
            entry.encrypted_token = Some(ciphertext);
            entry.iv = Some(iv);
            entry.token_hash = Some(hash);
            entry.expires_at = input.expires_at;
            merge_metadata(&mut entry.metadata, input.metadata);
            self.put_entry(&mut conn, &entry, "upsert_refresh_token").await?;
            Ok(entry.id)
        } else {
            let id = Uuid::new_v4();
            let now = OffsetDateTime::now_utc();
            let entry = VaultEntry {
                id,
                user_id: input.user_id.clone(),
                token_type: TokenType::Refresh,
                encrypted_token: Some(ciphertext),
                iv: Some(iv),
                token_hash: Some(hash),
                session_state_id: Some(input.session_state_id),
                created_at: now,
                expires_at: input.expires_at,
                status: auth_vault::types::EntryStatus::Active,
                task_id: None,
                ack_state: None,
                metadata: input.metadata,
            };
            self.put_entry(&mut conn, &entry, "upsert_refresh_token").await?;
            let _: () = conn
                .sadd(user_tokens_key(&input.user_id), id.to_string())
                .await
                .map_err(|e| to_vault_error("upsert_refresh_token", e))?;
            let _: () = conn
                .set(user_refresh_key(&input.user_id), id.to_string())
                .await
                .map_err(|e| to_vault_error("upsert_refresh_token", e))?;
            Ok(id)
        }
    }

    async fn retrieve_user_persistent_id_by_session(
        &self,
        session_state_id: &str,
    ) -> VaultResult<Option<Uuid>> {
        let mut entries: Vec<VaultEntry> = self
            .scan_all("retrieve_user_persistent_id_by_session")
            .await?
            .into_iter()
            .filter(|e| e.token_type == TokenType::Offline && e.session_state_id.as_deref() == Some(session_state_id))
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries.first().map(|e| e.id))
    }

    async fn retrieve_all_by_session_state_id(
        &self,
        session_state_id: &str,
        exclude_id: Option<Uuid>,
        token_type: Option<TokenType>,
    ) -> VaultResult<Vec<VaultEntry>> {
        let mut entries: Vec<VaultEntry> = self
            .scan_all("retrieve_all_by_session_state_id")
            .await?
            .into_iter()
            .filter(|e| e.session_state_id.as_deref() == Some(session_state_id))
            .filter(|e| exclude_id != Some(e.id))
            .filter(|e| token_type.is_none_or(|t| e.token_type == t))
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn retrieve_duplicate_token_hash(&self, hash: &str, exclude_id: Uuid) -> VaultResult<bool> {
        let entries = self.scan_all("retrieve_duplicate_token_hash").await?;
        Ok(entries
            .into_iter()
            .any(|e| e.id != exclude_id && e.token_hash.as_deref() == Some(hash)))
    }

    async fn get_by_ack_state(&self, ack_state: &str) -> VaultResult<Option<VaultEntry>> {
        let mut conn = self.conn("get_by_ack_state").await?;
        let id_str: Option<String> = conn
            .get(ack_state_key(ack_state))
            .await
            .map_err(|e| to_vault_error("get_by_ack_state", e))?;
        let Some(id_str) = id_str else { return Ok(None) };
        let Ok(id) = id_str.parse::<Uuid>() else { return Ok(None) };
        self.get_entry(&mut conn, id, "get_by_ack_state").await
    }

    async fn update_ack_state(&self, id: Uuid, ack_state: &str) -> VaultResult<()> {
        let mut conn = self.conn("update_ack_state").await?;
        let Some(mut entry) = self.get_entry(&mut conn, id, "update_ack_state").await? else {
            return Ok(());
        };
        if let Some(old) = &entry.ack_state {
            let _: () = conn.del(ack_state_key(old)).await.map_err(|e| to_vault_error("update_ack_state", e))?;
        }
        entry.ack_state = Some(ack_state.to_string());
        self.put_entry(&mut conn, &entry, "update_ack_state").await?;
        let ttl = ttl_secs(entry.expires_at);
        let _: () = conn
            .set_ex(ack_state_key(ack_state), id.to_string(), ttl)
            .await
            .map_err(|e| to_vault_error("update_ack_state", e))?;
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> VaultResult<Vec<VaultEntry>> {
        let mut conn = self.conn("list_by_user").await?;
        let ids: Vec<String> = conn
            .smembers(user_tokens_key(user_id))
            .await
            .map_err(|e| to_vault_error("list_by_user", e))?;
        let mut entries = Vec::with_capacity(ids.len());
        for id_str in ids {
            let Ok(id) = id_str.parse::<Uuid>() else { continue };
            if let Some(entry) = self.get_entry(&mut conn, id, "list_by_user").await? {
                entries.push(entry);
            } else {
                let _: () = conn
                    .srem(user_tokens_key(user_id), id_str)
                    .await
                    .map_err(|e| to_vault_error("list_by_user", e))?;
            }
        }
        Ok(entries)
    }

    /// Native TTL discharges I5 passively; there is nothing for a sweep to do.
    async fn cleanup_expired(&self) -> VaultResult<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_clamped_to_at_least_one_second() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(ttl_secs(now - time::Duration::seconds(5)), 1);
        assert!(ttl_secs(now + time::Duration::seconds(30)) >= 29);
    }

    #[test]
    fn key_helpers_format_as_expected() {
        let id = Uuid::nil();
        assert_eq!(token_key(id), format!("token:{id}"));
        assert_eq!(user_tokens_key("u1"), "user:u1:tokens");
        assert_eq!(user_refresh_key("u1"), "user:u1:refresh");
        assert_eq!(ack_state_key("abc"), "ackState:abc");
    }
}
