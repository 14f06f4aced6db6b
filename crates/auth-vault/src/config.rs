//! Flat environment-variable configuration (§6.2): literal, unprefixed
//! env var names, read directly rather than through a nested
//! section/prefix config layout.

use std::time::Duration;

use crate::crypto::VaultKey;

/// Which `VaultStorage` implementation to construct at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Redis,
}

#[derive(Clone)]
pub struct VaultConfig {
    pub idp_issuer: String,
    pub idp_client_id: String,
    pub idp_client_secret: String,
    pub idp_realm: String,
    pub idp_admin_base_url: String,
    pub callback_url: String,
    pub encryption_key: VaultKey,
    pub storage_backend: StorageBackend,
    pub database_url: Option<String>,
    pub redis_host: Option<String>,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_tls: bool,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub offline_token_ttl: Duration,
    pub session_ttl: Duration,
}

fn env_var(name: &str) -> Result<String, String> {
    std::env::var(name).map_err(|_| format!("missing required env var {name}"))
}

fn env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn env_duration(name: &str, default: Duration) -> Result<Duration, String> {
    match std::env::var(name) {
        Ok(raw) => humantime::parse_duration(&raw)
            .map_err(|e| format!("invalid duration in {name}: {e}")),
        Err(_) => Ok(default),
    }
}

impl VaultConfig {
    /// Loads and validates configuration from the process environment.
    /// Fails fast: an absent/malformed encryption key or missing required
    /// IdP fields is a fatal configuration error, not a runtime one.
    pub fn from_env() -> Result<Self, String> {
        let idp_issuer = env_var("IDP_ISSUER")?;
        let idp_client_id = env_var("IDP_CLIENT_ID")?;
        let idp_client_secret = env_var("IDP_CLIENT_SECRET")?;
        let idp_realm = env_var("IDP_REALM")?;
        let idp_admin_base_url =
            env_var_opt("IDP_ADMIN_BASE_URL").unwrap_or_else(|| idp_issuer.clone());
        let callback_url = env_var("AUTH_MANAGER_CALLBACK_URL")?;

        let key_raw = env_var("AUTH_MANAGER_TOKEN_VAULT_ENCRYPTION_KEY")?;
        let encryption_key = VaultKey::from_hex(&key_raw)?;

        let storage_backend = match env_var("AUTH_MANAGER_VAULT_STORAGE")?.as_str() {
            "pg" => StorageBackend::Postgres,
            "redis" => StorageBackend::Redis,
            other => return Err(format!("unrecognized AUTH_MANAGER_VAULT_STORAGE: {other}")),
        };

        let database_url = env_var_opt("AUTH_MANAGER_DATABASE_URL");
        if storage_backend == StorageBackend::Postgres && database_url.is_none() {
            return Err("AUTH_MANAGER_DATABASE_URL required when storage backend is pg".to_string());
        }

        let redis_host = env_var_opt("REDIS_HOST");
        if storage_backend == StorageBackend::Redis && redis_host.is_none() {
            return Err("REDIS_HOST required when storage backend is redis".to_string());
        }
        let redis_port = env_var_opt("REDIS_PORT")
            .map(|p| p.parse::<u16>().map_err(|e| format!("invalid REDIS_PORT: {e}")))
            .transpose()?
            .unwrap_or(6379);
        let redis_password = env_var_opt("REDIS_PASSWORD");
        let redis_tls = env_var_opt("REDIS_TLS").as_deref() == Some("true");

        Ok(Self {
            idp_issuer,
            idp_client_id,
            idp_client_secret,
            idp_realm,
            idp_admin_base_url,
            callback_url,
            encryption_key,
            storage_backend,
            database_url,
            redis_host,
            redis_port,
            redis_password,
            redis_tls,
            access_token_ttl: env_duration("AUTH_MANAGER_ACCESS_TOKEN_TTL", Duration::from_secs(3600))?,
            refresh_token_ttl: env_duration(
                "AUTH_MANAGER_REFRESH_TOKEN_TTL",
                Duration::from_secs(12 * 3600),
            )?,
            offline_token_ttl: env_duration(
                "AUTH_MANAGER_OFFLINE_TOKEN_TTL",
                Duration::from_secs(10 * 24 * 3600),
            )?,
            session_ttl: env_duration("AUTH_MANAGER_SESSION_TTL", Duration::from_secs(10 * 3600))?,
        })
    }
}
