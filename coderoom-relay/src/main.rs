//! CodeRoom relay: forwards document updates and presence between the
//! participants of each room.

use clap::Parser;
use log::info;

use coderoom_collab::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "CODEROOM_BIND", default_value = "127.0.0.1:1234")]
    bind: String,

    /// Maximum connections per room
    #[arg(long, env = "CODEROOM_MAX_PEERS", default_value_t = 16)]
    max_peers: usize,

    /// Frames buffered per connection before it starts lagging
    #[arg(long, env = "CODEROOM_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between heartbeats
    #[arg(long, env = "CODEROOM_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = SyncServer::new(ServerConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers,
        broadcast_capacity: args.broadcast_capacity,
        heartbeat_interval_secs: args.heartbeat_secs,
    });

    info!("Starting CodeRoom relay on {}...", server.bind_addr());

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
