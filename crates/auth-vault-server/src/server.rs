use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use auth_vault::config::{StorageBackend, VaultConfig};
use auth_vault::http::{AppState, router};
use auth_vault::idp::{IdpClient, IdpClientConfig};
use auth_vault::storage::VaultStorage;
use auth_vault_postgres::PostgresVaultStorage;
use auth_vault_redis::RedisVaultStorage;
use axum::Router;

const DEFAULT_ADDR: &str = "0.0.0.0:8089";

/// Sweep interval for the background `cleanup_expired` task (§4.5/I5).
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Builds the `redis://` connection URL from the flat env-var fields.
/// Pulled out of `build_storage` so it can be unit-tested without a
/// running Redis.
fn redis_url(config: &VaultConfig) -> String {
    let host = config
        .redis_host
        .as_deref()
        .expect("validated present in VaultConfig::from_env");
    let scheme = if config.redis_tls { "rediss" } else { "redis" };
    match &config.redis_password {
        Some(password) => format!("{scheme}://:{password}@{host}:{}", config.redis_port),
        None => format!("{scheme}://{host}:{}", config.redis_port),
    }
}

async fn build_storage(config: &VaultConfig) -> anyhow::Result<Arc<dyn VaultStorage>> {
    match config.storage_backend {
        StorageBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .expect("validated present in VaultConfig::from_env");
            let storage =
                PostgresVaultStorage::connect(database_url, config.encryption_key.clone()).await?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Redis => {
            let redis_config = deadpool_redis::Config::from_url(redis_url(config));
            let pool = redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

            // Fail fast: a token vault with an unreachable store cannot serve
            // any request, so there is no local-fallback mode to degrade to.
            pool.get().await?;

            Ok(Arc::new(RedisVaultStorage::new(pool, config.encryption_key.clone())))
        }
    }
}

fn build_app(config: Arc<VaultConfig>, storage: Arc<dyn VaultStorage>) -> Router {
    let idp = Arc::new(IdpClient::new(IdpClientConfig {
        issuer: config.idp_issuer.clone(),
        client_id: config.idp_client_id.clone(),
        client_secret: config.idp_client_secret.clone(),
        realm: config.idp_realm.clone(),
        admin_base_url: config.idp_admin_base_url.clone(),
    }));

    let state = AppState::new(storage, idp, config);
    router(state)
}

fn spawn_cleanup_sweep(storage: Arc<dyn VaultStorage>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match storage.cleanup_expired().await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "swept expired vault entries");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "cleanup sweep failed"),
            }
        }
    });
}

pub struct VaultServer {
    addr: SocketAddr,
    app: Router,
    storage: Arc<dyn VaultStorage>,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: VaultConfig,
}

impl ServerBuilder {
    pub fn new(config: VaultConfig) -> Self {
        Self {
            addr: DEFAULT_ADDR.parse().expect("valid default socket addr"),
            config,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub async fn build(self) -> anyhow::Result<VaultServer> {
        let config = Arc::new(self.config);
        let storage = build_storage(&config).await?;
        let app = build_app(config, storage.clone());

        Ok(VaultServer {
            addr: self.addr,
            app,
            storage,
        })
    }
}

impl VaultServer {
    pub async fn run(self) -> anyhow::Result<()> {
        spawn_cleanup_sweep(self.storage);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_vault::crypto::VaultKey;
    use std::time::Duration;

    fn base_config() -> VaultConfig {
        VaultConfig {
            idp_issuer: "https://idp.example.com/realms/test".into(),
            idp_client_id: "auth-manager".into(),
            idp_client_secret: "secret".into(),
            idp_realm: "test".into(),
            idp_admin_base_url: "https://idp.example.com".into(),
            callback_url: "https://auth-manager.example.com/callback".into(),
            encryption_key: VaultKey::from_hex(&"ab".repeat(32)).unwrap(),
            storage_backend: StorageBackend::Redis,
            database_url: None,
            redis_host: Some("cache.example.com".into()),
            redis_port: 6379,
            redis_password: None,
            redis_tls: false,
            access_token_ttl: Duration::from_secs(3600),
            refresh_token_ttl: Duration::from_secs(12 * 3600),
            offline_token_ttl: Duration::from_secs(10 * 24 * 3600),
            session_ttl: Duration::from_secs(10 * 3600),
        }
    }

    #[test]
    fn redis_url_without_password() {
        let config = base_config();
        assert_eq!(redis_url(&config), "redis://cache.example.com:6379");
    }

    #[test]
    fn redis_url_with_password_and_tls() {
        let mut config = base_config();
        config.redis_password = Some("s3cret".into());
        config.redis_tls = true;
        assert_eq!(
            redis_url(&config),
            "rediss://:s3cret@cache.example.com:6379"
        );
    }
}
