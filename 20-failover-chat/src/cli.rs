use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{HeartbeatSettings, NodeConfig, PeerSettings, ReconnectPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the primary node: serve clients and replicate to the backup.
    Primary(PrimaryArgs),
    /// Run the backup node: replay the primary's traffic and take over if it dies.
    Backup(BackupArgs),
    /// Connect to a node and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PrimaryArgs {
    /// Socket address for client connections. Use port 0 for an ephemeral port.
    #[arg(long, env = "FAILOVER_LISTEN", default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Address of the backup node's listener.
    #[arg(long, env = "FAILOVER_BACKUP_ADDR", default_value = "127.0.0.1:5001")]
    pub backup: SocketAddr,

    /// Pause between attempts to reach the backup.
    #[arg(
        long,
        env = "FAILOVER_PEER_RETRY_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub peer_retry_ms: u64,

    #[command(flatten)]
    pub heartbeat: HeartbeatArgs,
}

impl PrimaryArgs {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::primary(self.backup)
            .heartbeat(self.heartbeat.settings())
            .peer(PeerSettings {
                retry_delay: Duration::from_millis(self.peer_retry_ms),
                ..PeerSettings::default()
            })
    }
}

#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    /// Socket address for client and peer-link connections.
    #[arg(long, env = "FAILOVER_LISTEN", default_value = "127.0.0.1:5001")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub heartbeat: HeartbeatArgs,
}

impl BackupArgs {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::backup().heartbeat(self.heartbeat.settings())
    }
}

/// Heartbeat timing. Both nodes should be started with the same values.
#[derive(Args, Debug, Clone)]
pub struct HeartbeatArgs {
    /// Interval between heartbeats from primary to backup.
    #[arg(
        long,
        env = "FAILOVER_HEARTBEAT_INTERVAL_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats after which the backup promotes itself.
    #[arg(
        long,
        env = "FAILOVER_MISSED_HEARTBEATS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub missed_heartbeats: u32,
}

impl HeartbeatArgs {
    pub fn settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            missed_beats: self.missed_heartbeats,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the node to connect to.
    #[arg(long, env = "FAILOVER_SERVER", default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,

    /// Delay before each reconnection attempt.
    #[arg(long, env = "FAILOVER_RECONNECT_DELAY_MS", default_value_t = 2000)]
    pub reconnect_delay_ms: u64,

    /// Consecutive reconnection attempts before giving up.
    #[arg(long, env = "FAILOVER_MAX_RECONNECT_ATTEMPTS", default_value_t = 5)]
    pub max_reconnect_attempts: u32,
}

impl ClientArgs {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}
