use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{HubConfig, ReclaimPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub, accepting WebSocket connections on /ws/chat.
    Server(ServerArgs),
    /// Connect to a hub and chat, upload files, or request documents.
    Client(ClientArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    /// Periodically drop uploads whose connection is gone.
    Sweep,
    /// Drop a connection's uploads as soon as it closes.
    OnDisconnect,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Number of background workers for document jobs.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Simulated document rendering time, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    pub pdf_delay_ms: u64,

    /// How long shutdown waits for background jobs, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    pub shutdown_grace_ms: u64,

    /// Outbound frames buffered per peer before it is disconnected.
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
    pub peer_queue: u32,

    /// Directory for upload scratch files. Defaults to the system temp dir.
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// When to clean up uploads abandoned by a closed connection.
    #[arg(long, value_enum, default_value_t = ReclaimMode::Sweep)]
    pub reclaim: ReclaimMode,

    /// Seconds between abandoned-upload sweeps.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval_secs: u64,

    /// Seconds an orphaned upload may stay idle before a sweep drops it.
    #[arg(long, default_value_t = 60)]
    pub orphan_grace_secs: u64,
}

impl ServerArgs {
    pub fn hub_config(&self) -> HubConfig {
        let reclaim = match self.reclaim {
            ReclaimMode::OnDisconnect => ReclaimPolicy::OnDisconnect,
            ReclaimMode::Sweep => ReclaimPolicy::Sweep {
                interval: Duration::from_secs(self.sweep_interval_secs),
                grace: Duration::from_secs(self.orphan_grace_secs),
            },
        };

        HubConfig {
            upload_dir: self
                .upload_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            workers: usize::from(self.workers),
            pdf_delay: Duration::from_millis(self.pdf_delay_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            peer_queue: self.peer_queue as usize,
            reclaim,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name shown next to your messages.
    #[arg(long, default_value = "Anon")]
    pub user: String,

    /// WebSocket URL of the hub.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws/chat")]
    pub server: String,
}
