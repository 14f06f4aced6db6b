use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

/// Error taxonomy for the vault core, one variant per machine-readable
/// code in the external error contract.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("token is not active")]
    TokenNotActive,

    #[error("token expired")]
    TokenExpired,

    #[error("missing bearer token")]
    MissingBearerToken,

    #[error("invalid bearer token")]
    InvalidBearerToken,

    #[error("token not found: {message}")]
    TokenNotFound { message: String },

    #[error("no refresh token on file for this session")]
    NoRefreshToken,

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("invalid token id")]
    InvalidTokenId,

    #[error("invalid token type: {message}")]
    InvalidTokenType { message: String },

    #[error("forbidden")]
    Forbidden,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("cleanup error: {message}")]
    CleanupError { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("token introspection failed")]
    TokenIntrospectionFailed,

    #[error("identity provider error: {message}")]
    KeycloakError { message: String },

    #[error("connection error: {message}")]
    ConnectionError { message: String },
}

impl VaultError {
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    #[must_use]
    pub fn token_not_found(message: impl Into<String>) -> Self {
        Self::TokenNotFound { message: message.into() }
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    #[must_use]
    pub fn invalid_token_type(message: impl Into<String>) -> Self {
        Self::InvalidTokenType { message: message.into() }
    }

    #[must_use]
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage { operation: operation.into(), message: message.into() }
    }

    #[must_use]
    pub fn cleanup_error(message: impl Into<String>) -> Self {
        Self::CleanupError { message: message.into() }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    #[must_use]
    pub fn keycloak_error(message: impl Into<String>) -> Self {
        Self::KeycloakError { message: message.into() }
    }

    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError { message: message.into() }
    }

    /// Stable machine-readable code, per the external error contract.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::TokenNotActive => "token_not_active",
            Self::TokenExpired => "token_expired",
            Self::MissingBearerToken => "missing_bearer_token",
            Self::InvalidBearerToken => "invalid_bearer_token",
            Self::TokenNotFound { .. } => "token_not_found",
            Self::NoRefreshToken => "no_refresh_token",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::InvalidTokenId => "invalid_token_id",
            Self::InvalidTokenType { .. } => "invalid_token_type",
            Self::Forbidden => "forbidden",
            Self::EncryptionFailed => "encryption_failed",
            Self::DecryptionFailed => "decryption_failed",
            Self::Storage { .. } => "storage_error",
            Self::CleanupError { .. } => "cleanup_error",
            Self::Internal { .. } => "internal_error",
            Self::TokenIntrospectionFailed => "token_introspection_failed",
            Self::KeycloakError { .. } => "keycloak_error",
            Self::ConnectionError { .. } => "connection_error",
        }
    }

    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. }
            | Self::TokenNotActive
            | Self::TokenExpired
            | Self::MissingBearerToken
            | Self::InvalidBearerToken => StatusCode::UNAUTHORIZED,
            Self::TokenNotFound { .. } | Self::NoRefreshToken => StatusCode::NOT_FOUND,
            Self::InvalidRequest { .. } | Self::InvalidTokenId | Self::InvalidTokenType { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::EncryptionFailed
            | Self::DecryptionFailed
            | Self::Storage { .. }
            | Self::CleanupError { .. }
            | Self::Internal { .. }
            | Self::TokenIntrospectionFailed
            | Self::KeycloakError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConnectionError { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Best-effort structured detail attached to the error envelope.
    fn details(&self) -> Option<Value> {
        match self {
            Self::Storage { operation, message } => Some(serde_json::json!({
                "operation": operation,
                "reason": message,
            })),
            Self::TokenNotFound { message }
            | Self::InvalidRequest { message }
            | Self::InvalidTokenType { message }
            | Self::CleanupError { message }
            | Self::Internal { message }
            | Self::KeycloakError { message }
            | Self::ConnectionError { message }
            | Self::Unauthorized { message } if !message.is_empty() => {
                Some(serde_json::json!({ "reason": message }))
            }
            _ => None,
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.http_status().is_server_error()
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for VaultError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        } else {
            tracing::warn!(code = self.code(), "{}", self);
        }
        let status = self.http_status();
        let body = ErrorEnvelope {
            error: self.to_string(),
            code: self.code(),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}

pub type VaultResult<T> = Result<T, VaultError>;
