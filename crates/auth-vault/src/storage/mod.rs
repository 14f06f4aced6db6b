//! The `VaultStorage` trait (C2): a small, strict, backend-agnostic
//! interface over the token vault. Two real implementations live in
//! `auth-vault-postgres` and `auth-vault-redis`; an in-memory fake lives
//! here for unit tests that exercise C5/C6/C7 without a live backend.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::VaultResult;
use crate::types::{EntryStatus, TokenType, VaultEntry};

/// Input to `create`: plaintext in, ciphertext/hash computed by the
/// implementation before persistence. `expires_at` is caller-supplied
/// (from `config.refresh_token_ttl`/`offline_token_ttl`, per `token_type`)
/// rather than guessed by the storage backend.
pub struct CreateEntry {
    pub user_id: String,
    pub token: String,
    pub token_type: TokenType,
    pub session_state_id: Option<String>,
    pub expires_at: time::OffsetDateTime,
    pub metadata: HashMap<String, Value>,
}

/// Input to `create_pending`: the offline-consent entry minted before any
/// ciphertext exists (§4.5 step 2). No token field — I2 requires pending
/// entries to carry no ciphertext at all.
pub struct CreatePendingEntry {
    pub user_id: String,
    pub session_state_id: Option<String>,
    pub task_id: Option<String>,
    pub expires_at: time::OffsetDateTime,
    pub metadata: HashMap<String, Value>,
}

/// Input to `updateOfflineTokenById` (§4.2). `token: None` marks the
/// entry `Failed` without touching ciphertext.
pub struct UpdateOfflineToken {
    pub id: Uuid,
    pub token: Option<String>,
    pub status: EntryStatus,
    pub session_state_id: Option<String>,
    /// New absolute expiry; `None` leaves the existing value untouched
    /// (e.g. when simply marking an entry `Failed`).
    pub expires_at: Option<time::OffsetDateTime>,
}

/// Input to `upsertRefreshToken` (§4.2).
pub struct UpsertRefreshToken {
    pub user_id: String,
    pub token: String,
    pub session_state_id: String,
    pub metadata: HashMap<String, Value>,
    pub expires_at: time::OffsetDateTime,
}

#[async_trait]
pub trait VaultStorage: Send + Sync {
    async fn create(&self, input: CreateEntry) -> VaultResult<VaultEntry>;

    /// Inserts a `Pending` offline entry with no ciphertext (§4.5 step 2).
    async fn create_pending(&self, input: CreatePendingEntry) -> VaultResult<VaultEntry>;

    /// Enforces I5: an expired entry is deleted (best effort) and `None`
    /// is returned as if it never existed.
    async fn retrieve(&self, id: Uuid) -> VaultResult<Option<VaultEntry>>;

    /// Idempotent: deleting an absent id is not an error.
    async fn delete(&self, id: Uuid) -> VaultResult<()>;

    async fn get_user_refresh_token_by_id(&self, id: Uuid) -> VaultResult<Option<VaultEntry>>;
    async fn get_user_refresh_token_by_user_id(
        &self,
        user_id: &str,
    ) -> VaultResult<Option<VaultEntry>>;
    async fn get_user_refresh_token_by_session_id(
        &self,
        session_state_id: &str,
    ) -> VaultResult<Option<VaultEntry>>;

    async fn update_offline_token_by_id(&self, input: UpdateOfflineToken) -> VaultResult<()>;

    /// Preserves I4: at most one refresh entry per `(userId, sessionStateId)`.
    async fn upsert_refresh_token(&self, input: UpsertRefreshToken) -> VaultResult<Uuid>;

    /// Newest Offline entry for a session, ordered by `createdAt` DESC.
    async fn retrieve_user_persistent_id_by_session(
        &self,
        session_state_id: &str,
    ) -> VaultResult<Option<Uuid>>;

    /// Ordered by `createdAt` DESC; used for session co-tenancy checks.
    async fn retrieve_all_by_session_state_id(
        &self,
        session_state_id: &str,
        exclude_id: Option<Uuid>,
        token_type: Option<TokenType>,
    ) -> VaultResult<Vec<VaultEntry>>;

    async fn retrieve_duplicate_token_hash(
        &self,
        hash: &str,
        exclude_id: Uuid,
    ) -> VaultResult<bool>;

    async fn get_by_ack_state(&self, ack_state: &str) -> VaultResult<Option<VaultEntry>>;
    async fn update_ack_state(&self, id: Uuid, ack_state: &str) -> VaultResult<()>;

    /// Every live entry owned by `user_id`, of any token type. Backs the
    /// whole-user invalidate flow (§4.7); the KV backend maintains this as
    /// the `user:{userId}:tokens` set, the SQL backend as a plain scan on
    /// the `(userId, tokenType)` index.
    async fn list_by_user(&self, user_id: &str) -> VaultResult<Vec<VaultEntry>>;

    /// Periodic sweep for backends without native TTL. Backends with
    /// native TTL (Redis) implement this as a no-op returning `0`.
    async fn cleanup_expired(&self) -> VaultResult<u64>;
}

/// Merges `updates` into `existing` without discarding untouched keys,
/// per §4.2's "merges into metadata ... without discarding existing keys"
/// contract for `updateOfflineTokenById` and `upsertRefreshToken`.
pub fn merge_metadata(existing: &mut HashMap<String, Value>, updates: HashMap<String, Value>) {
    existing.extend(updates);
}

#[cfg(test)]
pub mod memory {
    //! In-memory `VaultStorage` fake. Used by C5/C6/C7 unit tests so they
    //! don't require a running Postgres/Redis.

    use std::sync::Mutex;

    use time::OffsetDateTime;

    use super::*;
    use crate::crypto;

    pub struct InMemoryVaultStorage {
        key: crate::crypto::VaultKey,
        entries: Mutex<HashMap<Uuid, VaultEntry>>,
    }

    impl InMemoryVaultStorage {
        pub fn new(key: crate::crypto::VaultKey) -> Self {
            Self { key, entries: Mutex::new(HashMap::new()) }
        }

        fn encrypt_token(&self, token: &str) -> VaultResult<(String, String, String)> {
            let iv = crypto::generate_iv();
            let ciphertext = crypto::encrypt(&self.key, &iv, token)?;
            let hash = crypto::hash(token);
            Ok((ciphertext, hex::encode(iv), hash))
        }

        pub fn seed(&self, entry: VaultEntry) {
            self.entries.lock().unwrap().insert(entry.id, entry);
        }
    }

    #[async_trait]
    impl VaultStorage for InMemoryVaultStorage {
        async fn create(&self, input: CreateEntry) -> VaultResult<VaultEntry> {
            let (ciphertext, iv, hash) = self.encrypt_token(&input.token)?;
            let now = OffsetDateTime::now_utc();
            let entry = VaultEntry {
                id: Uuid::new_v4(),
                user_id: input.user_id,
                token_type: input.token_type,
                encrypted_token: Some(ciphertext),
                iv: Some(iv),
                token_hash: Some(hash),
                session_state_id: input.session_state_id,
                created_at: now,
                expires_at: input.expires_at,
                status: EntryStatus::Active,
                task_id: None,
                ack_state: None,
                metadata: input.metadata,
            };
            self.entries.lock().unwrap().insert(entry.id, entry.clone());
            Ok(entry)
        }

        async fn create_pending(&self, input: CreatePendingEntry) -> VaultResult<VaultEntry> {
            let entry = VaultEntry {
                id: Uuid::new_v4(),
                user_id: input.user_id,
                token_type: TokenType::Offline,
                encrypted_token: None,
                iv: None,
                token_hash: None,
                session_state_id: input.session_state_id,
                created_at: OffsetDateTime::now_utc(),
                expires_at: input.expires_at,
                status: EntryStatus::Pending,
                task_id: input.task_id,
                ack_state: None,
                metadata: input.metadata,
            };
            self.entries.lock().unwrap().insert(entry.id, entry.clone());
            Ok(entry)
        }

        async fn retrieve(&self, id: Uuid) -> VaultResult<Option<VaultEntry>> {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&id) {
                Some(entry) if entry.is_expired() => {
                    entries.remove(&id);
                    Ok(None)
                }
                Some(entry) => Ok(Some(entry.clone())),
                None => Ok(None),
            }
        }

        async fn delete(&self, id: Uuid) -> VaultResult<()> {
            self.entries.lock().unwrap().remove(&id);
            Ok(())
        }

        async fn get_user_refresh_token_by_id(&self, id: Uuid) -> VaultResult<Option<VaultEntry>> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .get(&id)
                .filter(|e| e.token_type == TokenType::Refresh)
                .cloned())
        }

        async fn get_user_refresh_token_by_user_id(
            &self,
            user_id: &str,
        ) -> VaultResult<Option<VaultEntry>> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .values()
                .find(|e| e.user_id == user_id && e.token_type == TokenType::Refresh)
                .cloned())
        }

        async fn get_user_refresh_token_by_session_id(
            &self,
            session_state_id: &str,
        ) -> VaultResult<Option<VaultEntry>> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .values()
                .find(|e| {
                    e.session_state_id.as_deref() == Some(session_state_id)
                        && e.token_type == TokenType::Refresh
                })
                .cloned())
        }

        async fn update_offline_token_by_id(&self, input: UpdateOfflineToken) -> VaultResult<()> {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&input.id) else {
                return Ok(());
            };
            if let Some(token) = input.token {
                let (ciphertext, iv, hash) = self.encrypt_token(&token)?;
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
                HashMap::from([(
                    "tokenActivatedAt".to_string(),
                    Value::String(OffsetDateTime::now_utc().to_string()),
                )]),
            );
            Ok(())
        }

        async fn upsert_refresh_token(&self, input: UpsertRefreshToken) -> VaultResult<Uuid> {
            let existing_id = {
                let entries = self.entries.lock().unwrap();
                entries
                    .values()
                    .find(|e| {
                        e.session_state_id.as_deref() == Some(&input.session_state_id)
                            && e.token_type == TokenType::Refresh
                    })
                    .map(|e| e.id)
            };
            let (ciphertext, iv, hash) = self.encrypt_token(&input.token)?;
            let mut entries = self.entries.lock().unwrap();
            if let Some(id) = existing_id {
                let entry = entries.get_mut(&id).expect("looked up under the same lock scope");
                entry.encrypted_token = Some(ciphertext);
                entry.iv = Some(iv);
                entry.token_hash = Some(hash);
                entry.expires_at = input.expires_at;
                merge_metadata(&mut entry.metadata, input.metadata);
                Ok(id)
            } else {
                let now = OffsetDateTime::now_utc();
                let entry = VaultEntry {
                    id: Uuid::new_v4(),
                    user_id: input.user_id,
                    token_type: TokenType::Refresh,
                    encrypted_token: Some(ciphertext),
                    iv: Some(iv),
                    token_hash: Some(hash),
                    session_state_id: Some(input.session_state_id),
                    created_at: now,
                    expires_at: input.expires_at,
                    status: EntryStatus::Active,
                    task_id: None,
                    ack_state: None,
                    metadata: input.metadata,
                };
                let id = entry.id;
                entries.insert(id, entry);
                Ok(id)
            }
        }

        async fn retrieve_user_persistent_id_by_session(
            &self,
            session_state_id: &str,
        ) -> VaultResult<Option<Uuid>> {
            let entries = self.entries.lock().unwrap();
            let mut matches: Vec<&VaultEntry> = entries
                .values()
                .filter(|e| {
                    e.session_state_id.as_deref() == Some(session_state_id)
                        && e.token_type == TokenType::Offline
                })
                .collect();
            matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(matches.first().map(|e| e.id))
        }

        async fn retrieve_all_by_session_state_id(
            &self,
            session_state_id: &str,
            exclude_id: Option<Uuid>,
            token_type: Option<TokenType>,
        ) -> VaultResult<Vec<VaultEntry>> {
            let entries = self.entries.lock().unwrap();
            let mut matches: Vec<VaultEntry> = entries
                .values()
                .filter(|e| e.session_state_id.as_deref() == Some(session_state_id))
                .filter(|e| exclude_id != Some(e.id))
                .filter(|e| token_type.is_none_or(|t| e.token_type == t))
                .cloned()
                .collect();
            matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(matches)
        }

        async fn retrieve_duplicate_token_hash(
            &self,
            hash: &str,
            exclude_id: Uuid,
        ) -> VaultResult<bool> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .values()
                .any(|e| e.id != exclude_id && e.token_hash.as_deref() == Some(hash)))
        }

        async fn get_by_ack_state(&self, ack_state: &str) -> VaultResult<Option<VaultEntry>> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .values()
                .find(|e| e.ack_state.as_deref() == Some(ack_state))
                .cloned())
        }

        async fn update_ack_state(&self, id: Uuid, ack_state: &str) -> VaultResult<()> {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&id) {
                entry.ack_state = Some(ack_state.to_string());
            }
            Ok(())
        }

        async fn list_by_user(&self, user_id: &str) -> VaultResult<Vec<VaultEntry>> {
            let entries = self.entries.lock().unwrap();
            Ok(entries.values().filter(|e| e.user_id == user_id).cloned().collect())
        }

        async fn cleanup_expired(&self) -> VaultResult<u64> {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired());
            Ok((before - entries.len()) as u64)
        }
    }
}
