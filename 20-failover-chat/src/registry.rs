//! Live client connections known to a node.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};
use tracing::debug;

use crate::{
    error::{ChannelError, RegistryError},
    frame::Message,
};

pub type ClientId = u64;

/// Messages that may wait for one client's writer before the client is
/// treated as stalled.
pub const CLIENT_QUEUE_CAPACITY: usize = 128;

/// Sending side of one client connection.
///
/// Messages are queued for the connection's writer task, which owns the
/// socket. Once that task exits the queue closes and every further send
/// fails, which is how the broadcast engine notices dead clients. A client
/// that stops reading fills its queue and fails the same way.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    addr: SocketAddr,
    outbox: mpsc::Sender<Message>,
}

impl ClientHandle {
    pub fn new(id: ClientId, addr: SocketAddr) -> (Self, mpsc::Receiver<Message>) {
        Self::with_capacity(id, addr, CLIENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        id: ClientId,
        addr: SocketAddr,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (outbox, inbox) = mpsc::channel(capacity);
        (Self { id, addr, outbox }, inbox)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_live(&self) -> bool {
        !self.outbox.is_closed()
    }

    /// Queues `message` without waiting. A full queue counts as a closed
    /// connection.
    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        match self.outbox.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(client = self.id, "outbox full");
                Err(ChannelError::Closed)
            }
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }
}

/// Every mutation and every snapshot goes through one lock; broadcast
/// iterates over a snapshot so it never holds the lock while sending.
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn add(&self, handle: ClientHandle) -> Result<(), RegistryError> {
        let mut clients = self.clients.lock().await;
        if clients.contains_key(&handle.id) {
            return Err(RegistryError::AlreadyRegistered(handle.id));
        }
        clients.insert(handle.id, handle);
        Ok(())
    }

    /// Removing an unknown id is a no-op.
    pub async fn remove(&self, id: ClientId) -> Option<ClientHandle> {
        self.clients.lock().await.remove(&id)
    }

    pub async fn remove_all(&self, ids: &[ClientId]) -> Vec<ClientHandle> {
        let mut clients = self.clients.lock().await;
        ids.iter().filter_map(|id| clients.remove(id)).collect()
    }

    /// Copy of the current handles, ordered by id.
    pub async fn snapshot(&self) -> Vec<ClientHandle> {
        let mut handles: Vec<ClientHandle> = self.clients.lock().await.values().cloned().collect();
        handles.sort_by_key(ClientHandle::id);
        handles
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
