//! switchboard: a TCP relay for messaging and brokered remote calls
//!
//! Clients connect over a line-oriented protocol and can:
//! - Sign up and sign in (one live session per login)
//! - Send direct messages and broadcasts to other sessions
//! - Register named functions and serve calls to them
//! - Call functions registered by other sessions and wait for the reply
//!
//! Configuration via CLI arguments or TOML file.

mod broker;
mod config;
mod connection;
mod credentials;
mod messaging;
mod protocol;
mod registry;
mod server;

use config::{Config, StoreBackend};
use credentials::{CredentialStore, MemoryStore, SqliteStore};
use server::Server;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        call_timeout = ?config.call_timeout,
        store = ?config.store,
        "Starting switchboard server"
    );

    let store: Arc<dyn CredentialStore> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.database)?),
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(run(config, store))
}

/// Serve until the listener fails or the process is interrupted
async fn run(config: Config, store: Arc<dyn CredentialStore>) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(config, store);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
