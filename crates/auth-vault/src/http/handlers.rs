use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authenticator::{self, Validation};
use crate::consent;
use crate::error::{VaultError, VaultResult};
use crate::exchange;
use crate::revocation;
use crate::types::TokenType;

use super::state::AppState;

struct AuthenticatedRequest {
    user_id: String,
    session_id: String,
}

async fn require_bearer(state: &AppState, headers: &HeaderMap) -> VaultResult<AuthenticatedRequest> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match authenticator::authenticate(&state.idp, authorization).await {
        Validation::Valid { user_id, session_id, .. } => Ok(AuthenticatedRequest { user_id, session_id }),
        Validation::Invalid { reason } => Err(match reason.as_str() {
            "missing_bearer_token" => VaultError::MissingBearerToken,
            "invalid_bearer_token" => VaultError::InvalidBearerToken,
            "token_not_active" => VaultError::TokenNotActive,
            _ => VaultError::TokenIntrospectionFailed,
        }),
    }
}

pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Converts a `tower::timeout::error::Elapsed` (or any other service
/// error bubbling up through the layer stack) into a JSON error body.
pub async fn timeout_error(err: axum::BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        VaultError::connection_error("request timed out").into_response()
    } else {
        VaultError::internal(err.to_string()).into_response()
    }
}

pub async fn validate_token(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match require_bearer(&state, &headers).await {
        Ok(_) => Json(serde_json::json!({})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct RefreshTokenIdResponse {
    #[serde(rename = "persistentTokenId")]
    persistent_token_id: Uuid,
    #[serde(rename = "expiresAt")]
    #[serde(with = "time::serde::rfc3339")]
    expires_at: time::OffsetDateTime,
}

pub async fn refresh_token_id(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = match require_bearer(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    let entry = match state.storage.get_user_refresh_token_by_session_id(&auth.session_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return VaultError::NoRefreshToken.into_response(),
        Err(e) => return e.into_response(),
    };
    Json(RefreshTokenIdResponse { persistent_token_id: entry.id, expires_at: entry.expires_at })
        .into_response()
}

#[derive(Deserialize)]
pub struct AccessTokenQuery {
    id: Uuid,
}

#[derive(Serialize)]
struct AccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

pub async fn access_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AccessTokenQuery>,
) -> Response {
    if let Err(e) = require_bearer(&state, &headers).await {
        return e.into_response();
    }
    match exchange::exchange_for_access_token(
        &state.storage,
        &state.idp,
        &state.config,
        &state.config.encryption_key,
        query.id,
    )
    .await
    {
        Ok(outcome) => Json(AccessTokenResponse {
            access_token: outcome.access_token,
            expires_in: outcome.expires_in,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct OfflineConsentQuery {
    task_id: Option<String>,
}

#[derive(Serialize)]
struct OfflineConsentResponse {
    #[serde(rename = "consentUrl")]
    consent_url: String,
    #[serde(rename = "persistentTokenId")]
    persistent_token_id: Uuid,
    #[serde(rename = "stateToken")]
    state_token: String,
    message: String,
}

pub async fn offline_consent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OfflineConsentQuery>,
) -> Response {
    let auth = match require_bearer(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match consent::start_offline_consent(
        &state.storage,
        &state.config,
        &auth.user_id,
        &auth.session_id,
        query.task_id.as_deref(),
    )
    .await
    {
        Ok(outcome) => Json(OfflineConsentResponse {
            consent_url: outcome.consent_url,
            persistent_token_id: outcome.persistent_token_id,
            state_token: outcome.state_token,
            message: "redirect the user to consentUrl to continue".to_string(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct OfflineCallbackQuery {
    code: Option<String>,
    state: String,
    error: Option<String>,
}

/// On success the caller is redirected (302); errors are surfaced as JSON
/// since there is nowhere meaningful left to redirect to (§6.1).
pub async fn offline_callback(
    State(state): State<AppState>,
    Query(query): Query<OfflineCallbackQuery>,
) -> Response {
    match consent::handle_offline_callback(
        &state.storage,
        &state.idp,
        &state.config,
        query.code.as_deref(),
        &query.state,
        query.error.as_deref(),
    )
    .await
    {
        Ok(()) => Redirect::to(&format!("{}?status=success", state.config.callback_url)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct OfflineTokenIdResponse {
    #[serde(rename = "persistentTokenId")]
    persistent_token_id: Uuid,
    #[serde(rename = "sessionId")]
    session_id: String,
}

pub async fn get_offline_token_id(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = match require_bearer(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match state.storage.retrieve_user_persistent_id_by_session(&auth.session_id).await {
        Ok(Some(id)) => {
            Json(OfflineTokenIdResponse { persistent_token_id: id, session_id: auth.session_id })
                .into_response()
        }
        Ok(None) => VaultError::token_not_found("no offline token for this session").into_response(),
        Err(e) => e.into_response(),
    }
}

/// Mints a new offline token from the session's existing refresh token,
/// where the IdP accepts scope elevation without a fresh consent redirect
/// (§4.3 `requestOfflineToken`).
pub async fn post_offline_token_id(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = match require_bearer(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };

    let refresh_entry = match state
        .storage
        .get_user_refresh_token_by_session_id(&auth.session_id)
        .await
    {
        Ok(Some(entry)) => entry,
        Ok(None) => return VaultError::NoRefreshToken.into_response(),
        Err(e) => return e.into_response(),
    };

    let plaintext = match crate::crypto::decrypt_entry(&state.config.encryption_key, &refresh_entry) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };

    let token_response = match state.idp.request_offline_token(&plaintext).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    let Some(offline_token) = token_response.refresh_token else {
        return VaultError::keycloak_error("idp did not return an offline refresh token").into_response();
    };

    let ttl = match time::Duration::try_from(state.config.offline_token_ttl) {
        Ok(ttl) => ttl,
        Err(e) => return VaultError::internal(format!("invalid offline token ttl: {e}")).into_response(),
    };

    match state
        .storage
        .create(crate::storage::CreateEntry {
            user_id: auth.user_id.clone(),
            token: offline_token,
            token_type: TokenType::Offline,
            session_state_id: token_response.session_state.or(Some(auth.session_id.clone())),
            expires_at: time::OffsetDateTime::now_utc() + ttl,
            metadata: Default::default(),
        })
        .await
    {
        Ok(entry) => Json(OfflineTokenIdResponse {
            persistent_token_id: entry.id,
            session_id: auth.session_id,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct RevokeOfflineTokenQuery {
    id: Uuid,
}

#[derive(Serialize)]
struct RevokeOfflineTokenResponse {
    success: bool,
    revoked: bool,
    message: String,
}

pub async fn delete_offline_token_id(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RevokeOfflineTokenQuery>,
) -> Response {
    let auth = match require_bearer(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match revocation::revoke_token(&state.storage, &state.idp, &auth.user_id, query.id).await {
        Ok(outcome) => Json(RevokeOfflineTokenResponse {
            success: true,
            revoked: outcome.session_revoked,
            message: format!(
                "{} other token(s) remain on this session",
                outcome.tokens_with_same_session
            ),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct InvalidateResponse {
    success: bool,
}

pub async fn invalidate(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = match require_bearer(&state, &headers).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    match revocation::invalidate_user(&state.storage, &state.idp, &state.config.encryption_key, &auth.user_id)
        .await
    {
        Ok(()) => Json(InvalidateResponse { success: true }).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Marker used by `routes.rs` for the 404 fallback.
pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" }))).into_response()
}
