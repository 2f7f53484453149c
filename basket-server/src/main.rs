//! basket-server: hub process for the shared shopping list.
//!
//! Configuration comes from the environment (a `.env` file is loaded first
//! when present):
//!
//! | Variable | Default |
//! |----------|---------|
//! | `BASKET_BIND_ADDR` | `127.0.0.1:5157` |
//! | `BASKET_DATA_DIR` | unset (in-memory list) |
//! | `BASKET_JWT_SECRET` | development secret |
//! | `BASKET_PASSWORD` | `basket` |
//! | `BASKET_HEARTBEAT_SECS` | `15` |
//!
//! Log level is controlled by `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use basket_sync::{AuthConfig, JwtAuthenticator, ServerConfig, SyncServer};

fn server_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("BASKET_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(dir) = std::env::var("BASKET_DATA_DIR") {
        if !dir.is_empty() {
            config.storage_path = Some(PathBuf::from(dir));
        }
    }
    if let Ok(secs) = std::env::var("BASKET_HEARTBEAT_SECS") {
        match secs.parse::<u64>() {
            Ok(secs) if secs > 0 => {
                config.heartbeat_interval_secs = secs;
                config.client_timeout_secs = config.client_timeout_secs.max(secs * 2);
            }
            _ => log::warn!("Ignoring invalid BASKET_HEARTBEAT_SECS={secs}"),
        }
    }
    config
}

fn auth_config() -> AuthConfig {
    let mut config = AuthConfig::default();
    match std::env::var("BASKET_JWT_SECRET") {
        Ok(secret) if !secret.is_empty() => config.secret = secret,
        _ => log::warn!("BASKET_JWT_SECRET not set, using the development secret"),
    }
    if let Ok(password) = std::env::var("BASKET_PASSWORD") {
        config.password = password;
    }
    config
}

#[tokio::main]
async fn main() {
    let env_loaded = dotenv::dotenv();
    env_logger::init();

    match &env_loaded {
        Ok(path) => log::info!("Loaded {}", path.display()),
        Err(_) => log::debug!("No .env file found"),
    }

    let config = server_config();
    let verifier = Arc::new(JwtAuthenticator::new(auth_config()));

    let server = match SyncServer::new(config, verifier) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    log::info!("Starting basket server on {}", server.bind_addr());
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let closed = server.hub().broadcast().disconnect_all().await;
            log::info!("Shutting down, closed {closed} sessions");
        }
    }
}
