use auth_vault::config::{StorageBackend, VaultConfig};

/// `VaultConfig::from_env` runs against whatever the process environment
/// looks like, so these tests set every var they touch and clear them
/// afterwards rather than relying on test ordering.
fn clear_env() {
    for key in [
        "IDP_ISSUER",
        "IDP_CLIENT_ID",
        "IDP_CLIENT_SECRET",
        "IDP_REALM",
        "IDP_ADMIN_BASE_URL",
        "AUTH_MANAGER_CALLBACK_URL",
        "AUTH_MANAGER_TOKEN_VAULT_ENCRYPTION_KEY",
        "AUTH_MANAGER_VAULT_STORAGE",
        "AUTH_MANAGER_DATABASE_URL",
        "REDIS_HOST",
        "REDIS_PORT",
        "REDIS_PASSWORD",
        "REDIS_TLS",
    ] {
        unsafe { std::env::remove_var(key) };
    }
}

fn set_required_vars() {
    unsafe {
        std::env::set_var("IDP_ISSUER", "https://idp.example.com/realms/test");
        std::env::set_var("IDP_CLIENT_ID", "auth-manager");
        std::env::set_var("IDP_CLIENT_SECRET", "secret");
        std::env::set_var("IDP_REALM", "test");
        std::env::set_var(
            "AUTH_MANAGER_CALLBACK_URL",
            "https://auth-manager.example.com/callback",
        );
        std::env::set_var(
            "AUTH_MANAGER_TOKEN_VAULT_ENCRYPTION_KEY",
            "ab".repeat(32),
        );
    }
}

#[test]
fn from_env_requires_database_url_for_pg_backend() {
    clear_env();
    set_required_vars();
    unsafe {
        std::env::set_var("AUTH_MANAGER_VAULT_STORAGE", "pg");
    }

    let result = VaultConfig::from_env();
    assert!(result.is_err(), "expected missing AUTH_MANAGER_DATABASE_URL to fail");
    clear_env();
}

#[test]
fn from_env_succeeds_with_redis_backend() {
    clear_env();
    set_required_vars();
    unsafe {
        std::env::set_var("AUTH_MANAGER_VAULT_STORAGE", "redis");
        std::env::set_var("REDIS_HOST", "cache.example.com");
    }

    let config = VaultConfig::from_env().expect("valid redis config");
    assert_eq!(config.storage_backend, StorageBackend::Redis);
    assert_eq!(config.redis_port, 6379);
    clear_env();
}

#[test]
fn from_env_rejects_unrecognized_storage_backend() {
    clear_env();
    set_required_vars();
    unsafe {
        std::env::set_var("AUTH_MANAGER_VAULT_STORAGE", "sqlite");
    }

    let result = VaultConfig::from_env();
    assert!(result.is_err());
    clear_env();
}
