use serde::Deserialize;

/// Response shape shared by the token, offline-token, and
/// authorization-code-exchange calls (§4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub session_state: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// `{error, error_description}` shape returned by Keycloak-compatible
/// token endpoints on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct IdpErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// RFC 7662 introspection response, trimmed to the fields this service
/// reads (§3.3, §4.3, §4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

/// Identity claims returned by the userinfo endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
}
