//! Fan-out of user messages to every other client on the node.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    frame::Message,
    peer::PeerLink,
    registry::{ClientHandle, ClientId, ClientRegistry},
};

/// Where a broadcast message entered the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A directly connected client, which does not get its own message back.
    Client(ClientId),
    /// Replicated from the primary; every local client receives it.
    PeerLink,
}

impl Origin {
    fn excludes(self, handle: &ClientHandle) -> bool {
        matches!(self, Origin::Client(id) if id == handle.id())
    }
}

/// Outcome of one [`BroadcastEngine::broadcast`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<ClientId>,
    pub replicated: bool,
}

pub struct BroadcastEngine {
    registry: Arc<ClientRegistry>,
    replica: Option<Arc<PeerLink>>,
}

impl BroadcastEngine {
    /// Engine that only delivers to local clients.
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            replica: None,
        }
    }

    /// Engine that also forwards client messages over the peer link.
    pub fn with_replica(registry: Arc<ClientRegistry>, replica: Arc<PeerLink>) -> Self {
        Self {
            registry,
            replica: Some(replica),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Delivers `message` to every registered client except the origin.
    ///
    /// A failed send never stops delivery to the others. Failed clients are
    /// collected during the pass and unregistered once it completes.
    pub async fn broadcast(&self, origin: Origin, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        if let (Some(replica), Origin::Client(_)) = (&self.replica, origin) {
            report.replicated = replica.forward(message.clone()).await;
        }

        for handle in self.registry.snapshot().await {
            if origin.excludes(&handle) {
                continue;
            }
            match handle.send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(client = handle.id(), error = %err, "delivery failed");
                    report.dropped.push(handle.id());
                }
            }
        }

        if !report.dropped.is_empty() {
            for handle in self.registry.remove_all(&report.dropped).await {
                info!(client = handle.id(), peer = %handle.addr(), "dropped unreachable client");
            }
        }

        debug!(?origin, delivered = report.delivered, "broadcast complete");
        report
    }
}
