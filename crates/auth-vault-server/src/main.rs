use auth_vault::config::VaultConfig;
use auth_vault_server::{ServerBuilder, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match VaultConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let addr = std::env::var("AUTH_MANAGER_ADDR").ok().and_then(|raw| raw.parse().ok());

    let mut builder = ServerBuilder::new(config);
    if let Some(addr) = addr {
        builder = builder.with_addr(addr);
    }

    let server = match builder.build().await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("server init error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(err) = server.run().await {
        eprintln!("server error: {err}");
    }

    shutdown_tracing();
}
