//! Offline-access consent state machine (C5).

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;
use uuid::Uuid;

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::idp::IdpClient;
use crate::storage::{CreatePendingEntry, UpdateOfflineToken, VaultStorage};
use crate::types::{EntryStatus, StateToken};

pub struct ConsentOutcome {
    pub consent_url: String,
    pub persistent_token_id: Uuid,
    pub state_token: String,
}

/// Starts an offline-access request: a `Pending` entry plus a consent
/// redirect URL (§4.5 steps 1–4).
pub async fn start_offline_consent(
    storage: &Arc<dyn VaultStorage>,
    config: &VaultConfig,
    user_id: &str,
    session_id: &str,
    task_id: Option<&str>,
) -> VaultResult<ConsentOutcome> {
    let mut metadata = HashMap::new();
    if let Some(task_id) = task_id {
        metadata.insert("taskId".to_string(), serde_json::Value::String(task_id.to_string()));
    }

    let expires_at = time::OffsetDateTime::now_utc()
        + time::Duration::try_from(config.offline_token_ttl)
            .map_err(|e| VaultError::internal(format!("invalid offline token ttl: {e}")))?;

    let entry = storage
        .create_pending(CreatePendingEntry {
            user_id: user_id.to_string(),
            session_state_id: Some(session_id.to_string()),
            task_id: task_id.map(|t| t.to_string()),
            expires_at,
            metadata,
        })
        .await?;

    let state = StateToken::encode(user_id, session_id);
    storage.update_ack_state(entry.id, &state).await?;

    let mut url = Url::parse(&format!("{}/protocol/openid-connect/auth", config.idp_issuer))
        .map_err(|e| VaultError::internal(format!("invalid issuer url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.idp_client_id)
        .append_pair("scope", "openid profile email offline_access")
        .append_pair("redirect_uri", &config.callback_url)
        .append_pair("state", &state);

    Ok(ConsentOutcome {
        consent_url: url.to_string(),
        persistent_token_id: entry.id,
        state_token: state,
    })
}

/// Reconciles the IdP's callback redirect with the pending entry
/// (§4.5 step 6).
pub async fn handle_offline_callback(
    storage: &Arc<dyn VaultStorage>,
    idp: &IdpClient,
    config: &VaultConfig,
    code: Option<&str>,
    state: &str,
    idp_error: Option<&str>,
) -> VaultResult<()> {
    let entry = storage
        .get_by_ack_state(state)
        .await?
        .ok_or_else(|| VaultError::token_not_found("no pending entry for this state"))?;

    // Idempotency: a repeated callback for an already-settled entry must
    // not downgrade Active to Failed nor re-encrypt under a different token.
    // This has to run before the idp_error branch too, or a late/duplicate
    // callback carrying an error against an already-Active entry would
    // still downgrade it.
    if entry.status != EntryStatus::Pending {
        return Ok(());
    }

    if let Some(idp_error) = idp_error {
        storage
            .update_offline_token_by_id(UpdateOfflineToken {
                id: entry.id,
                token: None,
                status: EntryStatus::Failed,
                session_state_id: None,
                expires_at: None,
            })
            .await?;
        return Err(VaultError::keycloak_error(idp_error.to_string()));
    }

    let parsed = StateToken::parse(state)?;
    if parsed.user_id != entry.user_id {
        return Err(VaultError::invalid_request("state token does not match pending entry"));
    }

    let Some(code) = code else {
        storage
            .update_offline_token_by_id(UpdateOfflineToken {
                id: entry.id,
                token: None,
                status: EntryStatus::Failed,
                session_state_id: None,
                expires_at: None,
            })
            .await?;
        return Err(VaultError::invalid_request("missing authorization code"));
    };

    match idp.exchange_code(code, &config.callback_url).await {
        Ok(token_response) => match token_response.refresh_token {
            Some(refresh_token) => {
                storage
                    .update_offline_token_by_id(UpdateOfflineToken {
                        id: entry.id,
                        token: Some(refresh_token),
                        status: EntryStatus::Active,
                        session_state_id: token_response.session_state,
                        expires_at: None,
                    })
                    .await?;
                Ok(())
            }
            None => {
                storage
                    .update_offline_token_by_id(UpdateOfflineToken {
                        id: entry.id,
                        token: None,
                        status: EntryStatus::Failed,
                        session_state_id: None,
                        expires_at: None,
                    })
                    .await?;
                Err(VaultError::keycloak_error("token response missing refresh_token"))
            }
        },
        Err(e) => {
            storage
                .update_offline_token_by_id(UpdateOfflineToken {
                    id: entry.id,
                    token: None,
                    status: EntryStatus::Failed,
                    session_state_id: None,
                    expires_at: None,
                })
                .await?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::VaultKey;
    use crate::storage::memory::InMemoryVaultStorage;

    fn test_config() -> VaultConfig {
        VaultConfig {
            idp_issuer: "https://idp.example.com/realms/test".to_string(),
            idp_client_id: "client".to_string(),
            idp_client_secret: "secret".to_string(),
            idp_realm: "test".to_string(),
            idp_admin_base_url: "https://idp.example.com".to_string(),
            callback_url: "https://app.example.com/offline-callback".to_string(),
            encryption_key: VaultKey::from_hex(&"ab".repeat(32)).unwrap(),
            storage_backend: crate::config::StorageBackend::Postgres,
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
    async fn start_offline_consent_creates_pending_entry_with_state() {
        let storage: Arc<dyn VaultStorage> =
            Arc::new(InMemoryVaultStorage::new(VaultKey::from_hex(&"ab".repeat(32)).unwrap()));
        let config = test_config();

        let outcome = start_offline_consent(&storage, &config, "user-1", "sess-1", Some("task-1"))
            .await
            .unwrap();

        assert!(outcome.consent_url.contains("offline_access"));
        assert!(outcome.consent_url.contains(&outcome.state_token));

        let entry = storage
            .get_by_ack_state(&outcome.state_token)
            .await
            .unwrap()
            .expect("entry indexed by ack state");
        assert_eq!(entry.id, outcome.persistent_token_id);
        assert_eq!(entry.status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_error_callback_does_not_downgrade_active_entry() {
        let storage: Arc<dyn VaultStorage> =
            Arc::new(InMemoryVaultStorage::new(VaultKey::from_hex(&"ab".repeat(32)).unwrap()));
        let config = test_config();

        let outcome = start_offline_consent(&storage, &config, "user-1", "sess-1", None)
            .await
            .unwrap();

        storage
            .update_offline_token_by_id(UpdateOfflineToken {
                id: outcome.persistent_token_id,
                token: Some("rt-settled".to_string()),
                status: EntryStatus::Active,
                session_state_id: Some("sess-1".to_string()),
                expires_at: None,
            })
            .await
            .unwrap();

        handle_offline_callback(
            &storage,
            &idp_client_for_test(&config),
            &config,
            None,
            &outcome.state_token,
            Some("access_denied"),
        )
        .await
        .unwrap();

        let entry = storage
            .get_by_ack_state(&outcome.state_token)
            .await
            .unwrap()
            .expect("entry still present");
        assert_eq!(entry.status, EntryStatus::Active);
    }

    fn idp_client_for_test(config: &VaultConfig) -> IdpClient {
        IdpClient::new(crate::idp::IdpClientConfig {
            issuer: config.idp_issuer.clone(),
            client_id: config.idp_client_id.clone(),
            client_secret: config.idp_client_secret.clone(),
            realm: config.idp_realm.clone(),
            admin_base_url: config.idp_admin_base_url.clone(),
        })
    }
}
