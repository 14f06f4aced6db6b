//! Thin OIDC client (C3) with pooled, keep-alive HTTP transport.

use std::time::Duration;

use reqwest::Client;

use crate::error::{VaultError, VaultResult};

use super::types::{IdpErrorResponse, IntrospectionResponse, TokenResponse, UserInfoResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Confidential-client credentials and derived endpoint URLs for a single
/// IdP realm. Endpoints are derived from `IDP_ISSUER` by suffix, matching
/// Keycloak's well-known layout.
#[derive(Clone)]
pub struct IdpClientConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub realm: String,
    pub admin_base_url: String,
}

impl IdpClientConfig {
    fn token_endpoint(&self) -> String {
        format!("{}/protocol/openid-connect/token", self.issuer)
    }

    fn introspection_endpoint(&self) -> String {
        format!("{}/protocol/openid-connect/token/introspect", self.issuer)
    }

    fn userinfo_endpoint(&self) -> String {
        format!("{}/protocol/openid-connect/userinfo", self.issuer)
    }

    fn revocation_endpoint(&self) -> String {
        format!("{}/protocol/openid-connect/revoke", self.issuer)
    }

    fn admin_session_endpoint(&self, session_id: &str) -> String {
        format!(
            "{}/admin/realms/{}/sessions/{}",
            self.admin_base_url, self.realm, session_id
        )
    }
}

pub struct IdpClient {
    http: Client,
    config: IdpClientConfig,
}

impl IdpClient {
    pub fn new(config: IdpClientConfig) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self { http, config }
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> VaultResult<TokenResponse> {
        let response = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| VaultError::keycloak_error(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<IdpErrorResponse>(&body)
                .map(|e| {
                    format!(
                        "{}: {}",
                        e.error,
                        e.error_description.unwrap_or_default()
                    )
                })
                .unwrap_or(body);
            tracing::warn!(status = %status, "idp token endpoint returned error: {detail}");
            return Err(VaultError::keycloak_error(detail));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| VaultError::keycloak_error(format!("malformed token response: {e}")))
    }

    /// `grant_type=refresh_token` (§4.3).
    pub async fn refresh_access_token(&self, refresh_token: &str) -> VaultResult<TokenResponse> {
        self.post_form(
            &self.config.token_endpoint(),
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ],
        )
        .await
    }

    /// Same call, with explicit scope elevation. Used only where the IdP
    /// accepts it without a fresh user interaction; the preferred path for
    /// new offline grants goes through the consent state machine (C5).
    pub async fn request_offline_token(&self, refresh_token: &str) -> VaultResult<TokenResponse> {
        self.post_form(
            &self.config.token_endpoint(),
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", "openid profile email offline_access"),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ],
        )
        .await
    }

    /// `grant_type=authorization_code`, used by the consent callback (C5).
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> VaultResult<TokenResponse> {
        self.post_form(
            &self.config.token_endpoint(),
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ],
        )
        .await
    }

    pub async fn introspect(&self, access_token: &str) -> VaultResult<IntrospectionResponse> {
        let response = self
            .http
            .post(self.config.introspection_endpoint())
            .form(&[
                ("token", access_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|_| VaultError::TokenIntrospectionFailed)?;

        if !response.status().is_success() {
            return Err(VaultError::TokenIntrospectionFailed);
        }

        response
            .json::<IntrospectionResponse>()
            .await
            .map_err(|_| VaultError::TokenIntrospectionFailed)
    }

    pub async fn userinfo(&self, access_token: &str) -> VaultResult<UserInfoResponse> {
        let response = self
            .http
            .get(self.config.userinfo_endpoint())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| VaultError::keycloak_error(format!("userinfo request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VaultError::keycloak_error("userinfo returned non-2xx"));
        }

        response
            .json::<UserInfoResponse>()
            .await
            .map_err(|e| VaultError::keycloak_error(format!("malformed userinfo response: {e}")))
    }

    /// Standard token revocation endpoint. IdP errors are recoverable: the
    /// vault deletion has already occurred by the time this is called; the
    /// caller logs and continues (§4.3, §4.7).
    pub async fn revoke(&self, token: &str) -> VaultResult<()> {
        let response = self
            .http
            .post(self.config.revocation_endpoint())
            .form(&[
                ("token", token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| VaultError::keycloak_error(format!("revoke request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VaultError::keycloak_error("revoke returned non-2xx"));
        }
        Ok(())
    }

    /// Session-level revocation via the admin API. Requires a
    /// client-credentials admin token obtained on demand.
    pub async fn revoke_session(&self, session_id: &str) -> VaultResult<()> {
        let admin_token = self.admin_token().await?;
        let response = self
            .http
            .delete(self.config.admin_session_endpoint(session_id))
            .bearer_auth(admin_token)
            .send()
            .await
            .map_err(|e| VaultError::keycloak_error(format!("session revoke failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VaultError::keycloak_error("admin session delete returned non-2xx"));
        }
        Ok(())
    }

    async fn admin_token(&self) -> VaultResult<String> {
        let response = self
            .http
            .post(self.config.token_endpoint())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| VaultError::keycloak_error(format!("admin token request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VaultError::keycloak_error("admin token request returned non-2xx"));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| VaultError::keycloak_error(format!("malformed admin token response: {e}")))?;
        Ok(token.access_token)
    }
}
