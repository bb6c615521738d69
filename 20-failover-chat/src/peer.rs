//! The primary's replication link to the backup.
//!
//! [`PeerLink`] is the shared sending side that the broadcast engine and the
//! heartbeat sender push into. [`PeerLinkManager`] owns the socket: it dials
//! the backup, performs the handshake, drains the link's queue onto the
//! wire, and redials whenever the connection drops.
//!
//! Messages broadcast while the link is down are not replayed once it
//! comes back. The backup only sees traffic sent after the re-link.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
    },
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{HeartbeatSettings, PeerSettings},
    error::PeerError,
    frame::{FramedReader, FramedWriter, Message, split_tcp},
    heartbeat,
};

/// Messages that may wait for the peer-link writer. A backup that falls
/// this far behind is disconnected and re-linked.
pub const PEER_QUEUE_CAPACITY: usize = 1024;

/// Queue feeding the live peer link, if there is one.
pub struct PeerLink {
    outbox: Mutex<Option<mpsc::Sender<Message>>>,
    capacity: usize,
}

impl PeerLink {
    pub fn new() -> Self {
        Self::with_capacity(PEER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            outbox: Mutex::new(None),
            capacity,
        }
    }

    /// Installs a fresh queue for a newly established link and returns its
    /// receiving end. Any previous queue is dropped.
    pub async fn attach(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.outbox.lock().await = Some(tx);
        rx
    }

    pub async fn detach(&self) {
        self.outbox.lock().await.take();
    }

    pub async fn is_connected(&self) -> bool {
        self.outbox
            .lock()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Queues `message` for the backup without waiting. Returns `false` if
    /// there is no live link. A closed or full queue marks the link
    /// disconnected, which ends the current session once the writer has
    /// drained what was already queued.
    pub async fn forward(&self, message: Message) -> bool {
        let mut outbox = self.outbox.lock().await;
        let Some(tx) = outbox.as_ref() else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => return true,
            Err(TrySendError::Full(_)) => warn!("backup is not keeping up; dropping peer link"),
            Err(TrySendError::Closed(_)) => warn!("lost connection to backup"),
        }

        outbox.take();
        false
    }
}

impl Default for PeerLink {
    fn default() -> Self {
        Self::new()
    }
}

type LinkHalves = (FramedReader<OwnedReadHalf>, FramedWriter<OwnedWriteHalf>);

/// How a peer-link session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The node is shutting down.
    Cancelled,
    /// The backup closed the link before a full heartbeat interval passed.
    /// A promoted backup answers a returning primary this way.
    Refused,
    /// An established link failed.
    Closed,
}

/// Keeps the primary connected to its backup for as long as the node runs.
pub struct PeerLinkManager {
    backup: SocketAddr,
    link: Arc<PeerLink>,
    heartbeat: HeartbeatSettings,
    settings: PeerSettings,
}

impl PeerLinkManager {
    pub fn new(
        backup: SocketAddr,
        link: Arc<PeerLink>,
        heartbeat: HeartbeatSettings,
        settings: PeerSettings,
    ) -> Self {
        Self {
            backup,
            link,
            heartbeat,
            settings,
        }
    }

    /// Dials, serves, and redials until `cancel` fires. Connection failures
    /// are logged and retried after the configured delay; they never end
    /// the loop.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.establish().await {
                Ok(halves) => match self.serve(halves, &cancel).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Refused => warn!(
                        backup = %self.backup,
                        retry_in = ?self.settings.retry_delay,
                        "backup refused the peer link; it may have been promoted"
                    ),
                    SessionEnd::Closed => info!(backup = %self.backup, "peer link closed"),
                },
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_in = ?self.settings.retry_delay,
                        "failed to reach backup"
                    );
                }
            }

            select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.retry_delay) => {}
            }
        }
    }

    async fn establish(&self) -> Result<LinkHalves, PeerError> {
        let addr = self.backup;
        let stream = match timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(PeerError::Unreachable { addr, source }),
            Err(_) => {
                return Err(PeerError::Unreachable {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(backup = %addr, error = ?err, "failed to set TCP_NODELAY");
        }

        let (reader, mut writer) = split_tcp(stream);
        writer
            .send(&Message::peer_handshake())
            .await
            .map_err(|source| PeerError::Handshake { addr, source })?;

        Ok((reader, writer))
    }

    /// Drains the link queue onto the socket until either side fails.
    async fn serve(
        &self,
        (mut reader, mut writer): LinkHalves,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let session = cancel.child_token();
        let mut outbox = self.link.attach().await;
        let mut sender = tokio::spawn(heartbeat::run_sender(
            Arc::clone(&self.link),
            self.heartbeat.interval,
            session.clone(),
        ));
        let mut sender_finished = false;

        // The link only counts as accepted once it survives one interval.
        let settle = sleep(self.heartbeat.interval);
        tokio::pin!(settle);
        let mut accepted = false;
        let lost = |accepted: bool| {
            if accepted {
                SessionEnd::Closed
            } else {
                SessionEnd::Refused
            }
        };

        let end = loop {
            select! {
                _ = session.cancelled() => break SessionEnd::Cancelled,
                _ = &mut settle, if !accepted => {
                    accepted = true;
                    info!(backup = %self.backup, "connected to backup");
                }
                joined = &mut sender => {
                    sender_finished = true;
                    match joined {
                        Ok(()) => debug!("heartbeat sender stopped"),
                        Err(err) => warn!(error = ?err, "heartbeat sender failed"),
                    }
                    break SessionEnd::Closed;
                }
                queued = outbox.recv() => {
                    let Some(message) = queued else { break SessionEnd::Closed };
                    if let Err(err) = writer.send(&message).await {
                        debug!(error = %err, "write to backup failed");
                        break lost(accepted);
                    }
                }
                incoming = reader.receive() => {
                    match incoming {
                        Ok(message) => debug!(kind = ?message.kind(), "ignoring message from backup"),
                        Err(err) => {
                            debug!(error = %err, "backup closed the link");
                            break lost(accepted);
                        }
                    }
                }
            }
        };

        session.cancel();
        self.link.detach().await;
        if !sender_finished {
            if let Err(err) = sender.await {
                warn!(error = ?err, "heartbeat sender failed");
            }
        }
        writer.shutdown().await;
        end
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn fast_heartbeat() -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(20),
            missed_beats: 3,
        }
    }

    fn fast_retry() -> PeerSettings {
        PeerSettings {
            retry_delay: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn forward_without_link_reports_failure() {
        let link = PeerLink::new();
        assert!(!link.forward(Message::user("nobody")).await);
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn detach_disconnects() {
        let link = PeerLink::new();
        let _rx = link.attach().await;
        assert!(link.is_connected().await);
        link.detach().await;
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn full_queue_disconnects_the_link() {
        let link = PeerLink::with_capacity(4);
        let mut rx = link.attach().await;

        for n in 0..4 {
            assert!(link.forward(Message::user(format!("m{n}"))).await);
        }
        assert!(!link.forward(Message::user("overflow")).await);
        assert!(!link.is_connected().await);
        assert!(!link.forward(Message::user("later")).await);

        // What was queued before the overflow still drains, then the queue ends.
        for n in 0..4 {
            assert_eq!(rx.recv().await, Some(Message::user(format!("m{n}"))));
        }
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn link_closed_right_after_handshake_counts_as_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backup = listener.local_addr().unwrap();
        let heartbeat = HeartbeatSettings {
            interval: Duration::from_millis(500),
            missed_beats: 3,
        };
        let manager = PeerLinkManager::new(backup, Arc::new(PeerLink::new()), heartbeat, fast_retry());

        let refuse = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = split_tcp(stream);
            assert!(reader.receive().await.unwrap().is_peer_handshake());
        });

        let halves = manager.establish().await.unwrap();
        let end = manager.serve(halves, &CancellationToken::new()).await;
        refuse.await.unwrap();
        assert_eq!(end, SessionEnd::Refused);
    }

    #[tokio::test]
    async fn link_lost_after_it_settled_counts_as_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backup = listener.local_addr().unwrap();
        let heartbeat = HeartbeatSettings {
            interval: Duration::from_millis(50),
            missed_beats: 3,
        };
        let manager = PeerLinkManager::new(backup, Arc::new(PeerLink::new()), heartbeat, fast_retry());

        let backup_side = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = split_tcp(stream);
            assert!(reader.receive().await.unwrap().is_peer_handshake());
            // Keep reading heartbeats for a while, then go away.
            let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
            while tokio::time::Instant::now() < deadline {
                assert!(reader.receive().await.unwrap().is_heartbeat());
            }
        });

        let halves = manager.establish().await.unwrap();
        let end = manager.serve(halves, &CancellationToken::new()).await;
        backup_side.await.unwrap();
        assert_eq!(end, SessionEnd::Closed);
    }

    #[tokio::test]
    async fn cancelled_session_reports_cancellation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backup = listener.local_addr().unwrap();
        let manager = PeerLinkManager::new(backup, Arc::new(PeerLink::new()), fast_heartbeat(), fast_retry());
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let halves = manager.establish().await.unwrap();
        let _backup_stream = accept.await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(manager.serve(halves, &cancel).await, SessionEnd::Cancelled);
    }

    #[tokio::test]
    async fn manager_handshakes_then_forwards_and_pings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backup = listener.local_addr().unwrap();
        let link = Arc::new(PeerLink::new());
        let cancel = CancellationToken::new();
        let manager = PeerLinkManager::new(backup, Arc::clone(&link), fast_heartbeat(), fast_retry());
        let task = tokio::spawn(manager.run(cancel.clone()));

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = split_tcp(stream);
        let first = reader.receive().await.unwrap();
        assert!(first.is_peer_handshake());

        while !link.is_connected().await {
            tokio::task::yield_now().await;
        }
        assert!(link.forward(Message::user("replicated")).await);

        let mut saw_user = false;
        let mut saw_heartbeat = false;
        while !(saw_user && saw_heartbeat) {
            let message = tokio::time::timeout(Duration::from_secs(2), reader.receive())
                .await
                .expect("message from primary")
                .unwrap();
            if message == Message::user("replicated") {
                saw_user = true;
            } else if message == Message::heartbeat() {
                saw_heartbeat = true;
            }
        }

        cancel.cancel();
        task.await.unwrap();
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn manager_retries_until_backup_appears() {
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backup = placeholder.local_addr().unwrap();
        drop(placeholder);

        let link = Arc::new(PeerLink::new());
        let cancel = CancellationToken::new();
        let manager = PeerLinkManager::new(backup, Arc::clone(&link), fast_heartbeat(), fast_retry());
        let task = tokio::spawn(manager.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!link.is_connected().await);

        let listener = TcpListener::bind(backup).await.unwrap();
        let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("manager should redial")
            .unwrap();
        let (mut reader, _writer) = split_tcp(stream);
        assert!(reader.receive().await.unwrap().is_peer_handshake());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn manager_relinks_after_backup_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backup = listener.local_addr().unwrap();
        let link = Arc::new(PeerLink::new());
        let cancel = CancellationToken::new();
        let manager = PeerLinkManager::new(backup, Arc::clone(&link), fast_heartbeat(), fast_retry());
        let task = tokio::spawn(manager.run(cancel.clone()));

        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        let (second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("manager should relink")
            .unwrap();
        let (mut reader, _writer) = split_tcp(second);
        assert!(reader.receive().await.unwrap().is_peer_handshake());

        cancel.cancel();
        task.await.unwrap();
    }
}
