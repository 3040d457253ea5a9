//! Tessera relay — serves project rooms over WebSocket.
//!
//! Logging is configured through `RUST_LOG` (default `info`).

mod cli;

use clap::Parser;
use log::info;
use std::sync::Arc;

use tessera_collab::auth::StaticTokens;
use tessera_collab::server::SyncServer;
use tessera_collab::storage::CanvasStore;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut server = SyncServer::new(cli.server_config());

    if let Some(store_config) = cli.store_config() {
        let store = CanvasStore::open(store_config)?;
        info!("Persisting projects to {}", store.path().display());
        server = server.with_store(Arc::new(store));
    }

    if let Some(path) = &cli.token_file {
        let tokens = StaticTokens::from_file(path)?;
        info!("Loaded {} credentials from {}", tokens.len(), path.display());
        server = server.with_authenticator(Arc::new(tokens));
    }

    info!("Starting relay on {}", server.bind_addr());
    server.run().await?;
    Ok(())
}
