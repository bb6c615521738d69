//! Broadcast chat served by a primary node with a hot standby.
//!
//! See `README.md` for usage and the wire protocol. Each module focuses on
//! one responsibility:
//!
//! - [`frame`] turns a byte stream into length-prefixed messages.
//! - [`registry`] tracks the clients connected to a node.
//! - [`broadcast`] fans a message out to every other client and, on the
//!   primary, forwards it to the backup.
//! - [`peer`] keeps the primary's replication link to the backup alive.
//! - [`heartbeat`] sends liveness pings and watches for their absence.
//! - [`role`] owns the primary / backup / promoted role of a node.
//! - [`node`] accepts connections and decides whether each one is a client
//!   or the peer link.
//! - [`client`] is the reconnecting client session and terminal front-end.
//! - [`cli`] and [`config`] describe how nodes and clients are started.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod node;
pub mod peer;
pub mod registry;
pub mod role;
