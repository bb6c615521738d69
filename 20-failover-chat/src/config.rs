//! Typed settings for nodes and clients.
//!
//! The CLI fills these in from flags or environment variables; tests build
//! them directly with short timings.

use std::{net::SocketAddr, time::Duration};

use crate::role::Role;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatSettings {
    /// How often the primary pings the backup.
    pub interval: Duration,
    /// How many intervals of silence the backup tolerates before promoting.
    pub missed_beats: u32,
}

impl HeartbeatSettings {
    /// Silence after which the backup promotes. At least one interval,
    /// saturating instead of overflowing.
    pub fn timeout(&self) -> Duration {
        self.interval.saturating_mul(self.missed_beats.max(1))
    }

    /// Period of the backup's timeout check. Finer than the interval so
    /// promotion happens close to the deadline.
    pub fn check_period(&self) -> Duration {
        (self.interval / 4).max(Duration::from_millis(1))
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            missed_beats: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    /// Pause between failed attempts to reach the backup.
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

/// What a node starts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Serves clients and replicates to the backup at `backup`.
    Primary { backup: SocketAddr },
    /// Waits for the primary's peer link and takes over if it goes quiet.
    Backup,
}

impl NodeRole {
    pub fn initial_role(&self) -> Role {
        match self {
            NodeRole::Primary { .. } => Role::Primary,
            NodeRole::Backup => Role::Backup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub heartbeat: HeartbeatSettings,
    pub peer: PeerSettings,
    /// How long a backup waits for a new connection's first frame before
    /// treating it as a client.
    pub handshake_window: Duration,
}

impl NodeConfig {
    pub fn primary(backup: SocketAddr) -> Self {
        Self::with_role(NodeRole::Primary { backup })
    }

    pub fn backup() -> Self {
        Self::with_role(NodeRole::Backup)
    }

    fn with_role(role: NodeRole) -> Self {
        Self {
            role,
            heartbeat: HeartbeatSettings::default(),
            peer: PeerSettings::default(),
            handshake_window: Duration::from_millis(200),
        }
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatSettings) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn peer(mut self, peer: PeerSettings) -> Self {
        self.peer = peer;
        self
    }

    pub fn handshake_window(mut self, window: Duration) -> Self {
        self.handshake_window = window;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_three_seconds() {
        let settings = HeartbeatSettings::default();
        assert_eq!(settings.timeout(), Duration::from_secs(3));
        assert_eq!(settings.check_period(), Duration::from_millis(250));
    }

    #[test]
    fn builders_override_defaults() {
        let backup: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let config = NodeConfig::primary(backup)
            .heartbeat(HeartbeatSettings {
                interval: Duration::from_millis(50),
                missed_beats: 2,
            })
            .handshake_window(Duration::from_millis(10));

        assert_eq!(config.role.initial_role(), Role::Primary);
        assert_eq!(config.heartbeat.timeout(), Duration::from_millis(100));
        assert_eq!(config.handshake_window, Duration::from_millis(10));
        assert_eq!(config.peer, PeerSettings::default());
        assert_eq!(NodeConfig::backup().role.initial_role(), Role::Backup);
    }

    #[test]
    fn timeout_never_drops_below_one_interval_or_overflows() {
        let zero_beats = HeartbeatSettings {
            interval: Duration::from_millis(200),
            missed_beats: 0,
        };
        assert_eq!(zero_beats.timeout(), Duration::from_millis(200));

        let huge = HeartbeatSettings {
            interval: Duration::from_secs(u64::MAX / 2),
            missed_beats: u32::MAX,
        };
        assert_eq!(huge.timeout(), Duration::MAX);
    }
}
