//! Revocation & session reconciliation (C7).

use std::sync::Arc;

use uuid::Uuid;

use crate::crypto::{self, VaultKey};
use crate::error::{VaultError, VaultResult};
use crate::idp::IdpClient;
use crate::storage::VaultStorage;
use crate::types::TokenType;

pub struct TokenRevokeOutcome {
    pub session_revoked: bool,
    pub tokens_with_same_session: usize,
}

/// Revokes a single offline token, deciding whether to tear down the
/// upstream IdP session based on hash dedup / session co-tenancy (§4.7).
pub async fn revoke_token(
    storage: &Arc<dyn VaultStorage>,
    idp: &IdpClient,
    caller_user_id: &str,
    id: Uuid,
) -> VaultResult<TokenRevokeOutcome> {
    let entry = storage
        .retrieve(id)
        .await?
        .ok_or_else(|| VaultError::token_not_found("no entry with this id"))?;

    if entry.user_id != caller_user_id {
        return Err(VaultError::unauthorized("entry does not belong to caller"));
    }

    if entry.token_type != TokenType::Offline {
        return Err(VaultError::invalid_token_type("only offline tokens can be revoked here"));
    }

    let Some(session_state_id) = entry.session_state_id.clone() else {
        return Err(VaultError::invalid_token_type("entry has no session_state_id"));
    };
    if !entry.has_ciphertext() {
        return Err(VaultError::invalid_token_type("entry has no stored ciphertext"));
    }

    let other_same_session = storage
        .retrieve_all_by_session_state_id(&session_state_id, Some(id), Some(TokenType::Offline))
        .await?;

    // Delete before the IdP side effect: a crash here leaves the vault in
    // the tighter state rather than an inconsistent looser one.
    storage.delete(id).await?;

    let session_revoked = if other_same_session.is_empty() {
        match idp.revoke_session(&session_state_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("session revoke failed, continuing: {e}");
                false
            }
        }
    } else {
        false
    };

    Ok(TokenRevokeOutcome {
        session_revoked,
        tokens_with_same_session: other_same_session.len(),
    })
}

/// Revokes every token owned by a user, best-effort against the IdP
/// (§4.7 whole-user invalidate).
pub async fn invalidate_user(
    storage: &Arc<dyn VaultStorage>,
    idp: &IdpClient,
    key: &VaultKey,
    user_id: &str,
) -> VaultResult<()> {
    let entries = storage.list_by_user(user_id).await?;

    for entry in entries {
        if let Ok(plaintext) = crypto::decrypt_entry(key, &entry) {
            if let Err(e) = idp.revoke(&plaintext).await {
                tracing::warn!("idp revoke failed during invalidate, continuing: {e}");
            }
        }
        storage.delete(entry.id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::VaultKey;
    use crate::idp::{IdpClient, IdpClientConfig};
    use crate::storage::memory::InMemoryVaultStorage;
    use crate::storage::{CreateEntry, VaultStorage as _};

    fn test_idp() -> IdpClient {
        IdpClient::new(IdpClientConfig {
            issuer: "https://idp.example.com/realms/test".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            realm: "test".to_string(),
            admin_base_url: "https://idp.example.com".to_string(),
        })
    }

    #[tokio::test]
    async fn rejects_non_offline_token() {
        let key = VaultKey::from_hex(&"ab".repeat(32)).unwrap();
        let storage: Arc<dyn VaultStorage> = Arc::new(InMemoryVaultStorage::new(key));
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

        let idp = test_idp();
        let result = revoke_token(&storage, &idp, "user-1", entry.id).await;
        assert!(matches!(result, Err(VaultError::InvalidTokenType { .. })));
    }

    #[tokio::test]
    async fn rejects_wrong_owner() {
        let key = VaultKey::from_hex(&"ab".repeat(32)).unwrap();
        let storage: Arc<dyn VaultStorage> = Arc::new(InMemoryVaultStorage::new(key));
        let entry = storage
            .create(CreateEntry {
                user_id: "user-1".to_string(),
                token: "off-1".to_string(),
                token_type: TokenType::Offline,
                session_state_id: Some("sess-1".to_string()),
                expires_at: time::OffsetDateTime::now_utc() + time::Duration::days(10),
                metadata: Default::default(),
            })
            .await
            .unwrap();

        let idp = test_idp();
        let result = revoke_token(&storage, &idp, "user-2", entry.id).await;
        assert!(matches!(result, Err(VaultError::Unauthorized { .. })));
    }
}
