//! Access-token exchange & rotation (C6).

use std::sync::Arc;

use uuid::Uuid;

use crate::config::VaultConfig;
use crate::crypto;
use crate::error::{VaultError, VaultResult};
use crate::idp::IdpClient;
use crate::storage::{UpsertRefreshToken, VaultStorage, merge_metadata};
use crate::types::{EntryStatus, TokenType, VaultEntry};

pub struct AccessTokenExchange {
    pub access_token: String,
    pub expires_in: i64,
}

/// Exchanges a persistent vault id for a fresh access token, rotating the
/// stored refresh/offline token in place if the IdP returns a new one
/// (§4.6).
pub async fn exchange_for_access_token(
    storage: &Arc<dyn VaultStorage>,
    idp: &IdpClient,
    config: &VaultConfig,
    key: &crypto::VaultKey,
    id: Uuid,
) -> VaultResult<AccessTokenExchange> {
    let entry = storage
        .retrieve(id)
        .await?
        .ok_or_else(|| VaultError::token_not_found("no entry with this id"))?;

    if entry.status != EntryStatus::Active || !entry.has_ciphertext() {
        return Err(VaultError::token_not_found("entry has no active token (pending)"));
    }

    let plaintext = crypto::decrypt_entry(key, &entry)?;

    let token_response = idp.refresh_access_token(&plaintext).await?;

    if let Some(new_refresh_token) = token_response.refresh_token.clone() {
        rotate(storage, config, &entry, new_refresh_token, token_response.session_state.clone())
            .await?;
    }

    Ok(AccessTokenExchange {
        access_token: token_response.access_token,
        expires_in: token_response.expires_in,
    })
}

async fn rotate(
    storage: &Arc<dyn VaultStorage>,
    config: &VaultConfig,
    entry: &VaultEntry,
    new_refresh_token: String,
    new_session_state: Option<String>,
) -> VaultResult<()> {
    let mut metadata = entry.metadata.clone();
    merge_metadata(
        &mut metadata,
        std::collections::HashMap::from([(
            "updatedAt".to_string(),
            serde_json::Value::String(time::OffsetDateTime::now_utc().to_string()),
        )]),
    );

    match entry.token_type {
        TokenType::Refresh => {
            let session_state_id = new_session_state
                .or_else(|| entry.session_state_id.clone())
                .ok_or_else(|| VaultError::internal("refresh entry missing session_state_id"))?;
            let expires_at = time::OffsetDateTime::now_utc()
                + time::Duration::try_from(config.refresh_token_ttl)
                    .map_err(|e| VaultError::internal(format!("invalid refresh token ttl: {e}")))?;
            storage
                .upsert_refresh_token(UpsertRefreshToken {
                    user_id: entry.user_id.clone(),
                    token: new_refresh_token,
                    session_state_id,
                    metadata,
                    expires_at,
                })
                .await?;
        }
        TokenType::Offline => {
            // Preserve the caller's persistent id on rotation (§9, §4.6):
            // external systems keep the same handle across refresh-token
            // rotations, so this goes through `update_offline_token_by_id`
            // rather than minting a new row.
            let expires_at = time::OffsetDateTime::now_utc()
                + time::Duration::try_from(config.offline_token_ttl)
                    .map_err(|e| VaultError::internal(format!("invalid offline token ttl: {e}")))?;
            storage
                .update_offline_token_by_id(crate::storage::UpdateOfflineToken {
                    id: entry.id,
                    token: Some(new_refresh_token),
                    status: EntryStatus::Active,
                    session_state_id: new_session_state,
                    expires_at: Some(expires_at),
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::crypto::VaultKey;
    use crate::storage::memory::InMemoryVaultStorage;
    use crate::storage::{CreateEntry, VaultStorage as _};

    fn test_config() -> VaultConfig {
        VaultConfig {
            idp_issuer: "https://idp.example.com/realms/test".to_string(),
            idp_client_id: "client".to_string(),
            idp_client_secret: "secret".to_string(),
            idp_realm: "test".to_string(),
            idp_admin_base_url: "https://idp.example.com".to_string(),
            callback_url: "https://app.example.com/offline-callback".to_string(),
            encryption_key: VaultKey::from_hex(&"ab".repeat(32)).unwrap(),
            storage_backend: StorageBackend::Postgres,
            database_url: None,
            redis_host: None,
            redis_port: 6379,
            redis_password: None,
            redis_tls: false,
            access_token_ttl: std::time::Duration::from_secs(3600),
            refresh_token_ttl: std::time::Duration::from_secs(12 * 3600),
            offline_token_ttl: std::time::Duration::from_secs(10 * 24 * 3600),
            session_ttl: std::time::Duration::from_secs(10 * 3600),
        }
    }

    #[tokio::test]
    async fn rejects_pending_entries() {
        let key = VaultKey::from_hex(&"ab".repeat(32)).unwrap();
        let storage_impl = InMemoryVaultStorage::new(key.clone());
        let storage: Arc<dyn VaultStorage> = Arc::new(storage_impl);
        let entry = storage
            .create(CreateEntry {
                user_id: "user-1".to_string(),
                token: "rt-1".to_string(),
                token_type: TokenType::Refresh,
                session_state_id: Some("sess-1".to_string()),
                expires_at: time::OffsetDateTime::now_utc() + time::Duration::hours(12),
                metadata: Default::default(),
            })
            .await
            .unwrap();
        storage
            .update_offline_token_by_id(crate::storage::UpdateOfflineToken {
                id: entry.id,
                token: None,
                status: EntryStatus::Pending,
                session_state_id: None,
                expires_at: None,
            })
            .await
            .unwrap();

        let idp = IdpClient::new(crate::idp::IdpClientConfig {
            issuer: "https://idp.example.com/realms/test".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            realm: "test".to_string(),
            admin_base_url: "https://idp.example.com".to_string(),
        });
        let config = test_config();

        let result = exchange_for_access_token(&storage, &idp, &config, &key, entry.id).await;
        assert!(result.is_err());
    }
}
