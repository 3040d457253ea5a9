//! Command-line arguments for the relay.

use std::path::PathBuf;

use clap::Parser;
use tessera_collab::server::ServerConfig;
use tessera_collab::storage::StoreConfig;

/// Tessera synchronization relay
#[derive(Parser, Debug)]
#[command(name = "tessera-relay")]
#[command(about = "Relays canvas edits and presence between collaborating clients")]
#[command(version)]
pub struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090", env = "TESSERA_BIND")]
    pub bind: String,

    /// RocksDB directory for project state. In-memory only when omitted.
    #[arg(short = 'D', long, env = "TESSERA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Queued messages per project before slow peers are resynced
    #[arg(long, default_value_t = 256, env = "TESSERA_BROADCAST_CAPACITY")]
    pub broadcast_capacity: usize,

    /// Maximum connections per project
    #[arg(long, default_value_t = 100, env = "TESSERA_MAX_PEERS")]
    pub max_peers: usize,

    /// Seconds between relay pings
    #[arg(long, default_value_t = 30, env = "TESSERA_HEARTBEAT_SECS")]
    pub heartbeat_secs: u64,

    /// File of `user_id=token` lines. Everyone is admitted when omitted.
    #[arg(long, env = "TESSERA_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_peers_per_room: self.max_peers,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval: std::time::Duration::from_secs(self.heartbeat_secs.max(1)),
            ..ServerConfig::default()
        }
    }

    pub fn store_config(&self) -> Option<StoreConfig> {
        self.data_dir.as_ref().map(|path| StoreConfig {
            path: path.clone(),
            ..StoreConfig::default()
        })
    }
}
