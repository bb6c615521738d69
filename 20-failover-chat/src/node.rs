use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broadcast::{BroadcastEngine, Origin},
    config::{NodeConfig, NodeRole},
    error::ChannelError,
    frame::{FramedReader, FramedWriter, Kind, Message, split_tcp},
    heartbeat::{HeartbeatClock, HeartbeatMonitor},
    peer::{PeerLink, PeerLinkManager},
    registry::{ClientHandle, ClientId, ClientRegistry},
    role::{Role, RoleCoordinator},
};

/// A primary or backup chat node bound to its client-facing listener.
pub struct Node {
    listener: TcpListener,
    config: NodeConfig,
    state: Arc<NodeState>,
}

impl Node {
    pub fn new(listener: TcpListener, config: NodeConfig) -> Self {
        Self {
            listener,
            state: Arc::new(NodeState::new(&config)),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Serves until `shutdown` resolves, then cancels every connection and
    /// background task owned by the node.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Node {
            listener,
            config,
            state,
        } = self;
        let background = spawn_role_tasks(&config, &state);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        if let Err(err) = background.await {
            warn!(error = ?err, "background task failed");
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Read-only view of a running node.
#[derive(Clone)]
pub struct NodeHandle {
    state: Arc<NodeState>,
}

impl NodeHandle {
    pub fn role(&self) -> Role {
        self.state.role.role()
    }

    pub async fn client_count(&self) -> usize {
        self.state.engine.registry().len().await
    }

    /// On a primary: whether the link to the backup is up. On a backup:
    /// whether a primary is currently linked in.
    pub async fn peer_connected(&self) -> bool {
        match &self.state.outbound {
            Some(link) => link.is_connected().await,
            None => self.state.inbound_link.load(Ordering::Acquire),
        }
    }
}

struct NodeState {
    role: Arc<RoleCoordinator>,
    engine: BroadcastEngine,
    /// Primary only: queue into the link to the backup.
    outbound: Option<Arc<PeerLink>>,
    /// Backup only: refreshed by heartbeats from the primary.
    clock: Arc<HeartbeatClock>,
    /// Backup only: set while a primary's link is being served.
    inbound_link: AtomicBool,
    handshake_window: Duration,
    cancel: CancellationToken,
}

impl NodeState {
    fn new(config: &NodeConfig) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let (engine, outbound) = match config.role {
            NodeRole::Primary { .. } => {
                let link = Arc::new(PeerLink::new());
                (
                    BroadcastEngine::with_replica(registry, Arc::clone(&link)),
                    Some(link),
                )
            }
            NodeRole::Backup => (BroadcastEngine::new(registry), None),
        };

        Self {
            role: Arc::new(RoleCoordinator::new(config.role.initial_role())),
            engine,
            outbound,
            clock: Arc::new(HeartbeatClock::new()),
            inbound_link: AtomicBool::new(false),
            handshake_window: config.handshake_window,
            cancel: CancellationToken::new(),
        }
    }
}

fn spawn_role_tasks(config: &NodeConfig, state: &Arc<NodeState>) -> JoinHandle<()> {
    let cancel = state.cancel.clone();
    match (config.role, &state.outbound) {
        (NodeRole::Primary { backup }, Some(link)) => {
            let manager =
                PeerLinkManager::new(backup, Arc::clone(link), config.heartbeat, config.peer);
            tokio::spawn(manager.run(cancel))
        }
        _ => {
            let monitor = HeartbeatMonitor::new(
                Arc::clone(&state.clock),
                Arc::clone(&state.role),
                config.heartbeat,
            );
            tokio::spawn(monitor.run(cancel))
        }
    }
}

fn handle_shutdown(state: &NodeState) {
    info!(role = %state.role.role(), "node shutting down");
    state.cancel.cancel();
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, state: &Arc<NodeState>) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<NodeState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<NodeState>) -> Result<()> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = ?err, "failed to set TCP_NODELAY");
    }
    let (mut reader, writer) = split_tcp(stream);

    // Only a backup expects a peer link, so only a backup waits to see
    // whether the first frame is the handshake.
    let first = if state.role.role() == Role::Backup {
        match await_first_frame(&mut reader, state.handshake_window).await {
            Ok(first) => first,
            Err(ChannelError::Closed) => {
                debug!(peer = %peer, "connection closed before first frame");
                return Ok(());
            }
            Err(err) => return Err(err).context("reading first frame"),
        }
    } else {
        None
    };

    if first.as_ref().is_some_and(Message::is_peer_handshake) {
        return serve_peer_link(reader, writer, peer, &state).await;
    }
    serve_client(reader, writer, peer, first, &state).await
}

async fn await_first_frame(
    reader: &mut FramedReader<OwnedReadHalf>,
    window: Duration,
) -> Result<Option<Message>, ChannelError> {
    match timeout(window, reader.receive()).await {
        Ok(Ok(message)) => Ok(Some(message)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

/// Clears the backup's inbound-link flag when the link task exits.
struct InboundLinkGuard<'a>(&'a AtomicBool);

impl Drop for InboundLinkGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn serve_peer_link(
    mut reader: FramedReader<OwnedReadHalf>,
    _writer: FramedWriter<OwnedWriteHalf>,
    peer: SocketAddr,
    state: &NodeState,
) -> Result<()> {
    if state.role.role() != Role::Backup {
        warn!(peer = %peer, "rejecting peer link: node already promoted");
        return Ok(());
    }
    if state
        .inbound_link
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        warn!(peer = %peer, "rejecting peer link: one is already active");
        return Ok(());
    }
    let _guard = InboundLinkGuard(&state.inbound_link);

    info!(peer = %peer, "primary connected");
    state.clock.observe();

    loop {
        select! {
            _ = state.cancel.cancelled() => break,
            _ = state.role.wait_for_promotion() => {
                info!(peer = %peer, "closing peer link after promotion");
                break;
            }
            incoming = reader.receive() => {
                match incoming {
                    Ok(message) if message.is_heartbeat() => state.clock.observe(),
                    Ok(message) => {
                        state.engine.broadcast(Origin::PeerLink, &message).await;
                    }
                    Err(ChannelError::Closed) => {
                        info!(peer = %peer, "primary disconnected");
                        break;
                    }
                    Err(err) => return Err(err).context("reading from primary"),
                }
            }
        }
    }

    Ok(())
}

async fn serve_client(
    mut reader: FramedReader<OwnedReadHalf>,
    writer: FramedWriter<OwnedWriteHalf>,
    peer: SocketAddr,
    first: Option<Message>,
    state: &NodeState,
) -> Result<()> {
    let registry = state.engine.registry();
    let id = registry.next_id();
    let (handle, inbox) = ClientHandle::new(id, peer);
    registry.add(handle).await.context("registering client")?;
    info!(client = id, peer = %peer, "client joined");

    let mut writer_task = tokio::spawn(run_client_writer(writer, inbox, state.cancel.clone()));
    let result = run_client_session(id, &mut reader, first, &mut writer_task, state).await;

    registry.remove(id).await;
    writer_task.abort();
    info!(client = id, peer = %peer, "client disconnected");
    result
}

async fn run_client_session(
    id: ClientId,
    reader: &mut FramedReader<OwnedReadHalf>,
    first: Option<Message>,
    writer_task: &mut JoinHandle<()>,
    state: &NodeState,
) -> Result<()> {
    if let Some(message) = first {
        if !handle_client_message(id, message, state).await {
            return Ok(());
        }
    }

    loop {
        select! {
            _ = state.cancel.cancelled() => break,
            _ = &mut *writer_task => {
                debug!(client = id, "client writer stopped");
                break;
            }
            incoming = reader.receive() => {
                match incoming {
                    Ok(message) => {
                        if !handle_client_message(id, message, state).await {
                            break;
                        }
                    }
                    Err(ChannelError::Closed) => break,
                    Err(err) => return Err(err).context("reading from client"),
                }
            }
        }
    }

    Ok(())
}

/// Returns `false` when the connection should be closed.
async fn handle_client_message(id: ClientId, message: Message, state: &NodeState) -> bool {
    match message.kind() {
        Kind::User => {
            state.engine.broadcast(Origin::Client(id), &message).await;
            true
        }
        Kind::Heartbeat if message.is_peer_handshake() => {
            warn!(client = id, role = %state.role.role(), "unexpected peer handshake; closing");
            false
        }
        Kind::Heartbeat => {
            debug!(client = id, "ignoring heartbeat from client");
            true
        }
    }
}

async fn run_client_writer(
    mut writer: FramedWriter<OwnedWriteHalf>,
    mut inbox: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        select! {
            _ = cancel.cancelled() => break,
            queued = inbox.recv() => {
                let Some(message) = queued else { break };
                if let Err(err) = writer.send(&message).await {
                    debug!(error = %err, "failed to deliver message to client");
                    break;
                }
            }
        }
    }
    writer.shutdown().await;
}
